//! Budget tracking over the spend ledger.
//!
//! Nothing here is a counter: every figure is a fresh aggregation over the
//! append-only ledger, so a late record is reflected on the next read.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{SpendRecord, SpendSummary};
use crate::policy::Policy;
use crate::store::{ledger, Store, StoreError};

/// Spend classification against the all-time ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Normal,
    /// Past `lean_ratio` of the ceiling; new work prefers the free backend
    Lean,
    Exhausted,
}

impl BudgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Lean => "lean",
            Self::Exhausted => "exhausted",
        }
    }

    /// Classify spend against a ceiling
    pub fn classify(spent_usd: f64, ceiling_usd: f64, lean_ratio: f64) -> Self {
        if spent_usd >= ceiling_usd {
            Self::Exhausted
        } else if spent_usd >= ceiling_usd * lean_ratio {
            Self::Lean
        } else {
            Self::Normal
        }
    }
}

impl std::fmt::Display for BudgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`BudgetTracker::status`]
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub state: BudgetState,
    pub ceiling_usd: f64,
    /// `max(0, ceiling - spent)`
    pub remaining_usd: f64,
    pub daily_cloud_budget_usd: f64,
    pub spend: SpendSummary,
}

/// Midnight UTC of `now`'s day
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(chrono::NaiveTime::MIN))
}

/// Monday 00:00 UTC of `now`'s ISO week
pub fn start_of_week(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = now.weekday().num_days_from_monday() as i64;
    start_of_day(now) - Duration::days(days_since_monday)
}

#[derive(Clone)]
pub struct BudgetTracker {
    store: Store,
    policy: Policy,
}

impl BudgetTracker {
    pub fn new(store: Store, policy: Policy) -> Self {
        Self { store, policy }
    }

    /// Append one metered call to the ledger
    pub async fn record(&self, entry: SpendRecord) -> Result<(), StoreError> {
        self.store.call(move |conn| ledger::record(conn, &entry)).await
    }

    pub async fn spent_today(&self, now: DateTime<Utc>) -> Result<f64, StoreError> {
        let since = start_of_day(now);
        self.store
            .call(move |conn| ledger::spend_since(conn, since))
            .await
    }

    /// Today, this week and all time, as independent aggregations
    pub async fn summary(&self, now: DateTime<Utc>) -> Result<SpendSummary, StoreError> {
        let day = start_of_day(now);
        let week = start_of_week(now);
        self.store
            .call(move |conn| {
                Ok(SpendSummary {
                    today_usd: ledger::spend_since(conn, day)?,
                    week_usd: ledger::spend_since(conn, week)?,
                    all_time_usd: ledger::spend_total(conn)?,
                })
            })
            .await
    }

    pub async fn status(&self, now: DateTime<Utc>) -> Result<BudgetStatus, StoreError> {
        let spend = self.summary(now).await?;
        let ceiling_usd = self.policy.budget_ceiling_usd().await?;
        let lean_ratio = self.policy.lean_ratio().await?;
        let daily_cloud_budget_usd = self.policy.daily_cloud_budget_usd().await?;

        Ok(BudgetStatus {
            state: BudgetState::classify(spend.all_time_usd, ceiling_usd, lean_ratio),
            ceiling_usd,
            remaining_usd: (ceiling_usd - spend.all_time_usd).max(0.0),
            daily_cloud_budget_usd,
            spend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskKind;
    use crate::policy::keys;

    fn spend(cost_usd: f64, at: DateTime<Utc>) -> SpendRecord {
        SpendRecord {
            task: TaskKind::Planning,
            model: "claude-haiku".to_string(),
            input_tokens: 1000,
            output_tokens: 500,
            cost_usd,
            recorded_at: at,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(BudgetState::classify(10.0, 50.0, 0.8), BudgetState::Normal);
        assert_eq!(BudgetState::classify(40.0, 50.0, 0.8), BudgetState::Lean);
        assert_eq!(BudgetState::classify(50.0, 50.0, 0.8), BudgetState::Exhausted);
        assert_eq!(BudgetState::classify(0.0, 0.0, 0.8), BudgetState::Exhausted);
    }

    #[test]
    fn test_period_boundaries() {
        let wednesday = Utc.with_ymd_and_hms(2026, 10, 14, 15, 30, 0).unwrap();
        assert_eq!(
            start_of_day(wednesday),
            Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap()
        );
        assert_eq!(
            start_of_week(wednesday),
            Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_status_from_ledger() {
        let store = Store::open_in_memory().unwrap();
        let policy = Policy::in_memory();
        policy
            .set(keys::BUDGET_CEILING_USD, serde_json::json!(10.0))
            .await
            .unwrap();
        let tracker = BudgetTracker::new(store, policy);

        let now = Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap();
        tracker.record(spend(3.0, now - Duration::days(20))).await.unwrap();
        tracker.record(spend(4.0, now - Duration::days(1))).await.unwrap();
        tracker.record(spend(1.5, now)).await.unwrap();

        let status = tracker.status(now).await.unwrap();
        assert_eq!(status.spend.today_usd, 1.5);
        assert_eq!(status.spend.week_usd, 5.5);
        assert_eq!(status.spend.all_time_usd, 8.5);
        assert_eq!(status.state, BudgetState::Lean);
        assert!((status.remaining_usd - 1.5).abs() < 1e-9);

        tracker.record(spend(5.0, now)).await.unwrap();
        let status = tracker.status(now).await.unwrap();
        assert_eq!(status.state, BudgetState::Exhausted);
        assert_eq!(status.remaining_usd, 0.0);
    }
}
