//! Default reflector: survival from recent outcomes, source weights from
//! operator ratings.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use super::budget::{BudgetState, BudgetTracker};
use crate::adapters::Reflector;
use crate::domain::{OpportunityStatus, Survival};
use crate::policy::{keys, Policy};
use crate::store::{opportunities, Store};

/// Look-back window for shipped/killed counts
const REFLECTION_WINDOW_DAYS: i64 = 7;

const MIN_WEIGHT: f64 = 0.1;
const MAX_WEIGHT: f64 = 2.0;

/// Laplace-smoothed good ratio scaled so an unrated source sits at 1.0
pub fn weight_from_ratings(good: usize, bad: usize) -> f64 {
    let ratio = (good as f64 + 1.0) / ((good + bad) as f64 + 2.0);
    (ratio * 2.0).clamp(MIN_WEIGHT, MAX_WEIGHT)
}

pub struct MetricsReflector {
    store: Store,
    policy: Policy,
    budget: BudgetTracker,
}

impl MetricsReflector {
    pub fn new(store: Store, policy: Policy) -> Self {
        let budget = BudgetTracker::new(store.clone(), policy.clone());
        Self {
            store,
            policy,
            budget,
        }
    }
}

#[async_trait]
impl Reflector for MetricsReflector {
    async fn reflect(&self) -> anyhow::Result<Survival> {
        let now = Utc::now();
        let budget = self.budget.status(now).await?;
        if budget.state == BudgetState::Exhausted {
            return Ok(Survival::Critical);
        }

        let since = now - Duration::days(REFLECTION_WINDOW_DAYS);
        let (shipped, killed) = self
            .store
            .call(move |conn| {
                Ok::<_, crate::store::StoreError>((
                    opportunities::transitions_since(conn, OpportunityStatus::Shipped, since)?,
                    opportunities::transitions_since(conn, OpportunityStatus::Killed, since)?,
                ))
            })
            .await?;

        let survival = if shipped > 0 && shipped >= killed {
            Survival::Thriving
        } else if budget.state == BudgetState::Lean || (killed >= 3 && killed > shipped * 2) {
            Survival::Struggling
        } else {
            Survival::Stable
        };

        info!(%survival, shipped, killed, budget = %budget.state, "Reflection");
        Ok(survival)
    }

    async fn self_improve(&self) -> anyhow::Result<()> {
        let tallies = self.store.call(opportunities::ratings_by_source).await?;
        if tallies.is_empty() {
            return Ok(());
        }

        let mut weights = self.policy.source_weights().await?;
        for (source, good, bad) in tallies {
            let weight = weight_from_ratings(good, bad);
            info!(%source, good, bad, weight, "Source weight updated");
            weights.insert(source.to_lowercase(), weight);
        }

        let value: Value = json!(weights);
        self.policy.set(keys::SOURCE_WEIGHTS, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewOpportunity, Rating};
    use crate::core::OpportunityMachine;

    #[test]
    fn test_weight_from_ratings() {
        assert_eq!(weight_from_ratings(0, 0), 1.0);
        assert!(weight_from_ratings(9, 1) > 1.5);
        assert_eq!(weight_from_ratings(0, 50), MIN_WEIGHT);
        assert!(weight_from_ratings(100, 0) <= MAX_WEIGHT);
    }

    #[tokio::test]
    async fn test_quiet_system_is_stable() {
        let store = Store::open_in_memory().unwrap();
        let reflector = MetricsReflector::new(store, Policy::in_memory());
        assert_eq!(reflector.reflect().await.unwrap(), Survival::Stable);
    }

    #[tokio::test]
    async fn test_self_improve_derives_weights() {
        let store = Store::open_in_memory().unwrap();
        let policy = Policy::in_memory();
        let machine = OpportunityMachine::new(store.clone(), policy.clone());

        for rating in [Rating::Bad, Rating::Bad, Rating::Bad] {
            let opp = machine.insert(NewOpportunity::new("Spam", "Reddit")).await.unwrap();
            machine.rate(opp.id, rating).await.unwrap();
        }

        let reflector = MetricsReflector::new(store, policy.clone());
        reflector.self_improve().await.unwrap();

        let weights = policy.source_weights().await.unwrap();
        assert!(weights["reddit"] < 0.5);
    }
}
