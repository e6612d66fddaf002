//! Event types for the event-sourced opportunity lifecycle.
//!
//! Opportunity status is never written directly. Every change is an
//! immutable [`OpportunityEvent`] and the current status is the most recent
//! event for that opportunity.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of an opportunity (projected from its events)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    /// Inserted by a sensor, not yet looked at
    New,

    /// Selected by the scheduler, removed from future selection
    Reviewing,

    /// A planning job has been enqueued
    QueuedForPlanning,

    /// Planning scored above the pursue threshold
    Pursue,

    /// A validation artifact is live
    Building,

    /// A paid build completed
    Shipped,

    /// Expired, reaped as a zombie, or failed validation
    Killed,

    /// Planning scored below the pursue threshold
    Discarded,

    /// The planning job failed
    Error,
}

impl OpportunityStatus {
    pub const ALL: [OpportunityStatus; 9] = [
        Self::New,
        Self::Reviewing,
        Self::QueuedForPlanning,
        Self::Pursue,
        Self::Building,
        Self::Shipped,
        Self::Killed,
        Self::Discarded,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reviewing => "reviewing",
            Self::QueuedForPlanning => "queued_for_planning",
            Self::Pursue => "pursue",
            Self::Building => "building",
            Self::Shipped => "shipped",
            Self::Killed => "killed",
            Self::Discarded => "discarded",
            Self::Error => "error",
        }
    }

    /// Statuses reachable in one step from `self`
    pub fn successors(&self) -> &'static [OpportunityStatus] {
        use OpportunityStatus::*;
        match self {
            New => &[Reviewing, Discarded, Killed],
            Reviewing => &[QueuedForPlanning, Discarded, Error, Killed],
            QueuedForPlanning => &[Pursue, Discarded, Error, Killed],
            Pursue => &[Building, Discarded, Killed],
            Building => &[Shipped, Killed],
            Shipped | Killed | Discarded | Error => &[],
        }
    }

    /// Check whether moving from `self` to `next` is a legal edge
    pub fn can_transition_to(&self, next: OpportunityStatus) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Validate an edge, returning the typed violation on failure
    pub fn check_transition(&self, next: OpportunityStatus) -> Result<(), InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpportunityStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("opportunity status", s))
    }
}

/// A rejected status edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid status transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: OpportunityStatus,
    pub to: OpportunityStatus,
}

/// A stored string that does not name a known enum variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A single status change in the append-only opportunity log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityEvent {
    /// Monotonic sequence number assigned by the store
    pub id: i64,

    /// The opportunity this event belongs to
    pub opportunity_id: Uuid,

    /// Status the opportunity entered
    pub status: OpportunityStatus,

    /// Free-form context (reason, job id, score...)
    pub payload: serde_json::Value,

    /// When the event was appended
    pub timestamp: DateTime<Utc>,
}

/// Check that a recorded history is a valid path through the lifecycle
pub fn is_valid_history(events: &[OpportunityEvent]) -> bool {
    let mut iter = events.iter();
    let Some(first) = iter.next() else {
        return true;
    };
    if first.status != OpportunityStatus::New {
        return false;
    }

    let mut current = first.status;
    for event in iter {
        if !current.can_transition_to(event.status) {
            return false;
        }
        current = event.status;
    }
    true
}

/// Diagnostic event kinds written to the system event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    Digest,
    Reflection,
    SelfImprovement,
    Diagnostics,
    SensorFailed,
    PlanParseFallback,
    JobFailed,
    CloudBudgetRequested,
    CloudBudgetBlocked,
    CloudFallback,
    ValidationLaunchFailed,
    BuildFailed,
    ZombieKilled,
    ValidationExpired,
    ValidationConverted,
}

impl SystemEventKind {
    pub const ALL: [SystemEventKind; 15] = [
        Self::Digest,
        Self::Reflection,
        Self::SelfImprovement,
        Self::Diagnostics,
        Self::SensorFailed,
        Self::PlanParseFallback,
        Self::JobFailed,
        Self::CloudBudgetRequested,
        Self::CloudBudgetBlocked,
        Self::CloudFallback,
        Self::ValidationLaunchFailed,
        Self::BuildFailed,
        Self::ZombieKilled,
        Self::ValidationExpired,
        Self::ValidationConverted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Digest => "digest",
            Self::Reflection => "reflection",
            Self::SelfImprovement => "self_improvement",
            Self::Diagnostics => "diagnostics",
            Self::SensorFailed => "sensor_failed",
            Self::PlanParseFallback => "plan_parse_fallback",
            Self::JobFailed => "job_failed",
            Self::CloudBudgetRequested => "cloud_budget_requested",
            Self::CloudBudgetBlocked => "cloud_budget_blocked",
            Self::CloudFallback => "cloud_fallback",
            Self::ValidationLaunchFailed => "validation_launch_failed",
            Self::BuildFailed => "build_failed",
            Self::ZombieKilled => "zombie_killed",
            Self::ValidationExpired => "validation_expired",
            Self::ValidationConverted => "validation_converted",
        }
    }
}

impl fmt::Display for SystemEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemEventKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("system event kind", s))
    }
}

/// An entry in the diagnostic event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub kind: SystemEventKind,
    /// Opportunity, job or approval the event is about (if any)
    pub subject: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
