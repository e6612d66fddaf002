//! Inference task kinds and the append-only spend ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::UnknownVariant;

/// Category of an inference request; selects models on both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Code,
    Planning,
    Reflection,
    Chat,
    Scoring,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        Self::Code,
        Self::Planning,
        Self::Reflection,
        Self::Chat,
        Self::Scoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Planning => "planning",
            Self::Reflection => "reflection",
            Self::Chat => "chat",
            Self::Scoring => "scoring",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|task| task.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("task kind", s))
    }
}

/// One successful metered call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendRecord {
    pub task: TaskKind,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Independent aggregations over the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpendSummary {
    pub today_usd: f64,
    pub week_usd: f64,
    pub all_time_usd: f64,
}
