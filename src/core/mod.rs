//! Core orchestration logic.
//!
//! This module contains:
//! - OpportunityMachine: event-sourced lifecycle and selection
//! - JobQueue: atomic claim and concurrent processing of inference jobs
//! - ValidationController: capped validation launches and final builds
//! - CycleScheduler: the periodic digest/reflect/sense/select/enqueue cycle
//! - BudgetTracker: ledger-derived spend and budget state
//! - Runtime: the three loops and shutdown

pub mod budget;
pub mod controller;
pub mod guard;
pub mod queue;
pub mod reflection;
pub mod runtime;
pub mod scheduler;
pub mod state_machine;

// Re-export commonly used types
pub use budget::{BudgetState, BudgetStatus, BudgetTracker};
pub use controller::{ControllerReport, ValidationController};
pub use guard::SingleFlight;
pub use queue::{JobQueue, PollOutcome};
pub use reflection::MetricsReflector;
pub use runtime::Runtime;
pub use scheduler::{CycleScheduler, TickOutcome};
pub use state_machine::{OpportunityMachine, TransitionError};
