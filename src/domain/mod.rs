//! Domain types for the prospector agent.
//!
//! This module contains the core data structures:
//! - Events: immutable opportunity status changes and diagnostic events
//! - Opportunity: candidate ideas, status projected from events
//! - Job: deferred inference work
//! - Cycle, Approval, Validation, Spend: scheduler and budget records

pub mod approval;
pub mod cycle;
pub mod events;
pub mod job;
pub mod opportunity;
pub mod spend;
pub mod validation;

// Re-export commonly used types
pub use approval::{ApprovalRequest, ApprovalStatus};
pub use cycle::{Cycle, CycleStatus, Survival};
pub use events::{
    is_valid_history, InvalidTransition, OpportunityEvent, OpportunityStatus, SystemEvent,
    SystemEventKind, UnknownVariant,
};
pub use job::{Job, JobCounts, JobStatus, JobType};
pub use opportunity::{NewOpportunity, Opportunity, Rating, Scores};
pub use spend::{SpendRecord, SpendSummary, TaskKind};
pub use validation::{Validation, ValidationStatus};
