//! Opportunity records and their status projection.
//!
//! The stored row carries scores and text only. `status` and `status_since`
//! are filled in from the latest [`OpportunityEvent`] when the row is read.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{OpportunityEvent, OpportunityStatus, UnknownVariant};

/// A candidate business idea under evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub title: String,

    /// Where the opportunity was discovered (e.g. "reddit/r/saas")
    pub source: String,

    /// Raw evidentiary text captured by the sensor
    pub evidence: String,

    pub scores: Scores,

    /// Free-form plan produced by the planning job
    pub plan: Option<String>,

    /// Operator rating; never affects status
    pub rating: Option<Rating>,

    /// Projected from the latest event
    pub status: OpportunityStatus,

    /// Timestamp of the latest event
    pub status_since: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    /// Project the current status from an ordered event history
    pub fn project(events: &[OpportunityEvent]) -> Option<(OpportunityStatus, DateTime<Utc>)> {
        events.last().map(|e| (e.status, e.timestamp))
    }

    /// Days spent in the current status as of `now`
    pub fn days_in_status(&self, now: DateTime<Utc>) -> i64 {
        (now - self.status_since).num_days()
    }
}

/// Numeric scores attached to an opportunity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub pain: f64,
    #[serde(default)]
    pub willingness_to_pay: f64,
    #[serde(default)]
    pub competition: f64,
    #[serde(default)]
    pub viability: f64,
    /// Viability after source weighting (set at selection time)
    #[serde(default)]
    pub weighted_viability: f64,
}

/// Input for inserting a new opportunity (what a sensor produces)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub title: String,
    pub source: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub scores: Scores,
}

impl NewOpportunity {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source: source.into(),
            evidence: String::new(),
            scores: Scores::default(),
        }
    }

    pub fn with_viability(mut self, viability: f64) -> Self {
        self.scores.viability = viability;
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }
}

/// Operator verdict on an opportunity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Good,
    Bad,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(Self::Good),
            "bad" => Ok(Self::Bad),
            other => Err(UnknownVariant::new("rating", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_uses_latest_event() {
        let id = Uuid::new_v4();
        let earlier = Utc::now() - chrono::Duration::days(3);
        let later = Utc::now();
        let events = vec![
            OpportunityEvent {
                id: 1,
                opportunity_id: id,
                status: OpportunityStatus::New,
                payload: serde_json::Value::Null,
                timestamp: earlier,
            },
            OpportunityEvent {
                id: 2,
                opportunity_id: id,
                status: OpportunityStatus::Reviewing,
                payload: serde_json::Value::Null,
                timestamp: later,
            },
        ];

        let (status, since) = Opportunity::project(&events).unwrap();
        assert_eq!(status, OpportunityStatus::Reviewing);
        assert_eq!(since, later);
        assert!(Opportunity::project(&[]).is_none());
    }

    #[test]
    fn test_sensor_payload_defaults() {
        let parsed: NewOpportunity =
            serde_json::from_str(r#"{"title": "Invoice bot", "source": "hn"}"#).unwrap();
        assert_eq!(parsed.title, "Invoice bot");
        assert_eq!(parsed.scores, Scores::default());
        assert!(parsed.evidence.is_empty());
    }
}
