//! Deferred inference jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::UnknownVariant;

/// Job status: `pending → locked → running → done | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Locked,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Locked,
        Self::Running,
        Self::Done,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("job status", s))
    }
}

/// Kind of work a job performs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Produce a plan and a pursue score for an opportunity
    Plan,

    /// Re-score an opportunity's pain/willingness-to-pay/competition/viability
    Score,

    /// Anything else found in the table; processing fails it
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Plan => "plan",
            Self::Score => "score",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(s: &str) -> Self {
        match s {
            "plan" => Self::Plan,
            "score" => Self::Score,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A unit of deferred inference work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub input: serde_json::Value,
    pub status: JobStatus,
    pub output: Option<serde_json::Value>,

    /// Inference cost in USD (0 for local)
    pub cost_usd: f64,

    pub error: Option<String>,

    /// Worker that claimed the job
    pub claimed_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Opportunity id carried in the job input (plan and score jobs)
    pub fn opportunity_id(&self) -> Option<Uuid> {
        self.input
            .get("opportunity_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Whether the enqueuer asked for the free backend only
    pub fn force_local(&self) -> bool {
        self.input
            .get("force_local")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Job counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub locked: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Locked => self.locked += count,
            JobStatus::Running => self.running += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.locked + self.running + self.done + self.failed
    }

    /// Jobs claimed but not yet terminal
    pub fn in_flight(&self) -> usize {
        self.locked + self.running
    }
}
