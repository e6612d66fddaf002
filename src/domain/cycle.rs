//! Scheduler cycle records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::UnknownVariant;

/// One pass of the cycle scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,

    /// Failure or early-exit explanation
    pub note: Option<String>,
}

impl Cycle {
    pub fn is_closed(&self) -> bool {
        self.status != CycleStatus::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Success,
    Failed,
    BudgetExhausted,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "budget_exhausted" => Ok(Self::BudgetExhausted),
            other => Err(UnknownVariant::new("cycle status", other)),
        }
    }
}

/// Reflector verdict on recent performance. Worse verdicts reflect more often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Survival {
    Thriving,
    Stable,
    Struggling,
    Critical,
}

impl Survival {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thriving => "thriving",
            Self::Stable => "stable",
            Self::Struggling => "struggling",
            Self::Critical => "critical",
        }
    }

    /// Divisor applied to the base reflection interval
    pub fn interval_divisor(&self) -> f64 {
        match self {
            Self::Thriving => 1.0,
            Self::Stable => 2.0,
            Self::Struggling => 4.0,
            Self::Critical => 12.0,
        }
    }
}

impl Default for Survival {
    fn default() -> Self {
        Self::Stable
    }
}

impl fmt::Display for Survival {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Survival {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thriving" => Ok(Self::Thriving),
            "stable" => Ok(Self::Stable),
            "struggling" => Ok(Self::Struggling),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownVariant::new("survival assessment", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worse_survival_reflects_more_often() {
        let base = 24.0;
        let hours: Vec<f64> = [
            Survival::Thriving,
            Survival::Stable,
            Survival::Struggling,
            Survival::Critical,
        ]
        .iter()
        .map(|s| base / s.interval_divisor())
        .collect();
        assert_eq!(hours, vec![24.0, 12.0, 6.0, 2.0]);
    }

    #[test]
    fn test_cycle_status_parse() {
        assert_eq!(
            "budget_exhausted".parse::<CycleStatus>().unwrap(),
            CycleStatus::BudgetExhausted
        );
        assert!("paused".parse::<CycleStatus>().is_err());
    }
}
