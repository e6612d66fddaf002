//! prospector - autonomous opportunity agent
//!
//! Discovers candidate business opportunities, plans them with a language
//! model, validates the promising ones with preorder pages and builds the
//! ones that get paid, on a small fixed budget.
//!
//! # Architecture
//!
//! Three independent loops share one SQLite store:
//! - the cycle scheduler senses, selects and enqueues planning work
//! - the job poller claims jobs atomically and runs them through the model
//!   router, which prefers the free local backend once the daily cloud
//!   budget is spent
//! - the validation controller keeps a capped number of validations live
//!
//! Opportunity status is event-sourced: every change is an appended event
//! and the current status is the latest one.
//!
//! # Modules
//!
//! - `adapters`: External collaborators (Ollama, Anthropic, Telegram, commands)
//! - `brain`: Model routing, fallback chains and the approval gate
//! - `core`: State machine, job queue, controller, scheduler, budget
//! - `domain`: Data structures (Opportunity, Job, events, ledger)
//! - `store`: SQLite persistence
//! - `policy`: Runtime-tunable thresholds
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run all loops
//! prospector run
//!
//! # Approve an over-budget cloud call
//! prospector approve <approval-id>
//!
//! # Inspect an opportunity
//! prospector status <opportunity-id>
//! ```

pub mod adapters;
pub mod brain;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod policy;
pub mod store;

// Re-export main types at crate root for convenience
pub use brain::{BrainRequest, BrainResponse, ModelRouter};
pub use crate::core::{CycleScheduler, JobQueue, OpportunityMachine, ValidationController};
pub use domain::{Job, JobStatus, Opportunity, OpportunityStatus};
pub use policy::Policy;
pub use store::{Store, StoreError};
