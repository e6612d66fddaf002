//! Validation sub-lifecycle of an opportunity in `building`.
//!
//! ```text
//! pursue → building → active ─┬─ converted → shipped
//!                             ├─ expired   → killed
//!                             └─ zombie    → killed
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::UnknownVariant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub id: Uuid,
    pub opportunity_id: Uuid,

    /// Validation style; only "preorder" is launched today
    pub kind: String,

    pub status: ValidationStatus,

    /// Whatever the launcher returned (URL, deployment id...)
    pub artifact: String,

    /// Sum of recorded payments in USD
    pub payments_usd: f64,

    pub window_ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Validation {
    pub fn has_payment_signal(&self) -> bool {
        self.payments_usd > 0.0
    }

    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.window_ends_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Active,
    Converted,
    Expired,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Converted => "converted",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "converted" => Ok(Self::Converted),
            "expired" => Ok(Self::Expired),
            other => Err(UnknownVariant::new("validation status", other)),
        }
    }
}
