//! Runtime-tunable policy values.
//!
//! Policy is a key/value table with JSON values. Components never cache it:
//! every accessor reads through the injected [`PolicySource`], so a change
//! made by the reflector (or the operator) applies on the very next read.
//!
//! Missing or malformed values fall back to the documented defaults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::store::{policies, Store, StoreError};

/// Known policy keys
pub mod keys {
    pub const VIABILITY_FLOOR: &str = "viability_floor";
    pub const SOURCE_WEIGHTS: &str = "source_weights";
    pub const PURSUE_THRESHOLD: &str = "pursue_threshold";
    pub const DAILY_CLOUD_BUDGET_USD: &str = "daily_cloud_budget_usd";
    pub const BUDGET_CEILING_USD: &str = "budget_ceiling_usd";
    pub const LEAN_RATIO: &str = "lean_ratio";
    pub const MAX_CONCURRENT_VALIDATIONS: &str = "max_concurrent_validations";
    pub const ZOMBIE_DAYS: &str = "zombie_days";
    pub const VALIDATION_WINDOW_DAYS: &str = "validation_window_days";
    pub const REFLECTION_BASE_HOURS: &str = "reflection_base_hours";
    pub const SELF_IMPROVE_INTERVAL_HOURS: &str = "self_improve_interval_hours";

    pub const ALL: [&str; 11] = [
        VIABILITY_FLOOR,
        SOURCE_WEIGHTS,
        PURSUE_THRESHOLD,
        DAILY_CLOUD_BUDGET_USD,
        BUDGET_CEILING_USD,
        LEAN_RATIO,
        MAX_CONCURRENT_VALIDATIONS,
        ZOMBIE_DAYS,
        VALIDATION_WINDOW_DAYS,
        REFLECTION_BASE_HOURS,
        SELF_IMPROVE_INTERVAL_HOURS,
    ];
}

/// Default value for a known key
pub fn default_value(key: &str) -> Option<Value> {
    let value = match key {
        keys::VIABILITY_FLOOR => json!(40.0),
        keys::SOURCE_WEIGHTS => json!({}),
        keys::PURSUE_THRESHOLD => json!(70.0),
        keys::DAILY_CLOUD_BUDGET_USD => json!(2.0),
        keys::BUDGET_CEILING_USD => json!(50.0),
        keys::LEAN_RATIO => json!(0.8),
        keys::MAX_CONCURRENT_VALIDATIONS => json!(3),
        keys::ZOMBIE_DAYS => json!(14),
        keys::VALIDATION_WINDOW_DAYS => json!(7),
        keys::REFLECTION_BASE_HOURS => json!(24.0),
        keys::SELF_IMPROVE_INTERVAL_HOURS => json!(24.0),
        _ => return None,
    };
    Some(value)
}

/// Backing storage for policy values
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Every explicitly stored entry, sorted by key
    async fn entries(&self) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Policy stored in the `policies` table
pub struct StorePolicy {
    store: Store,
}

impl StorePolicy {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PolicySource for StorePolicy {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        self.store.call(move |conn| policies::get(conn, &key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let key = key.to_string();
        self.store
            .call(move |conn| policies::set(conn, &key, &value, Utc::now()))
            .await
    }

    async fn entries(&self) -> Result<Vec<(String, Value)>, StoreError> {
        self.store.call(policies::all).await
    }
}

/// Process-local policy, for tests and dry runs
#[derive(Default)]
pub struct InMemoryPolicy {
    values: Mutex<HashMap<String, Value>>,
}

impl InMemoryPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicy {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        let mut entries: Vec<_> = values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// Typed read-through accessor shared by every component
#[derive(Clone)]
pub struct Policy {
    source: Arc<dyn PolicySource>,
}

impl Policy {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self { source }
    }

    pub fn from_store(store: Store) -> Self {
        Self::new(Arc::new(StorePolicy::new(store)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPolicy::new()))
    }

    /// Raw value for a key, or its default
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.source.get(key).await?.or_else(|| default_value(key)))
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.source.set(key, value).await
    }

    /// Every known key with its effective value, plus any extra stored keys
    pub async fn effective(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let stored: HashMap<String, Value> = self.source.entries().await?.into_iter().collect();
        let mut merged: Vec<(String, Value)> = keys::ALL
            .iter()
            .filter_map(|key| {
                stored
                    .get(*key)
                    .cloned()
                    .or_else(|| default_value(key))
                    .map(|v| (key.to_string(), v))
            })
            .collect();
        for (key, value) in stored {
            if !keys::ALL.contains(&key.as_str()) {
                merged.push((key, value));
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(merged)
    }

    async fn number(&self, key: &str, default: f64) -> Result<f64, StoreError> {
        match self.source.get(key).await? {
            None => Ok(default),
            Some(value) => match value.as_f64() {
                Some(n) if n.is_finite() => Ok(n),
                _ => {
                    warn!(key, value = %value, "Malformed policy value, using default");
                    Ok(default)
                }
            },
        }
    }

    pub async fn viability_floor(&self) -> Result<f64, StoreError> {
        self.number(keys::VIABILITY_FLOOR, 40.0).await
    }

    pub async fn pursue_threshold(&self) -> Result<f64, StoreError> {
        self.number(keys::PURSUE_THRESHOLD, 70.0).await
    }

    pub async fn daily_cloud_budget_usd(&self) -> Result<f64, StoreError> {
        self.number(keys::DAILY_CLOUD_BUDGET_USD, 2.0).await
    }

    pub async fn budget_ceiling_usd(&self) -> Result<f64, StoreError> {
        self.number(keys::BUDGET_CEILING_USD, 50.0).await
    }

    pub async fn lean_ratio(&self) -> Result<f64, StoreError> {
        Ok(self.number(keys::LEAN_RATIO, 0.8).await?.clamp(0.0, 1.0))
    }

    pub async fn max_concurrent_validations(&self) -> Result<usize, StoreError> {
        let cap = self.number(keys::MAX_CONCURRENT_VALIDATIONS, 3.0).await?;
        Ok(cap.clamp(0.0, MAX_VALIDATION_SLOTS) as usize)
    }

    pub async fn zombie_days(&self) -> Result<i64, StoreError> {
        Ok(self.number(keys::ZOMBIE_DAYS, 14.0).await?.clamp(0.0, MAX_DAYS) as i64)
    }

    pub async fn validation_window_days(&self) -> Result<i64, StoreError> {
        Ok(self.number(keys::VALIDATION_WINDOW_DAYS, 7.0).await?.clamp(0.0, MAX_DAYS) as i64)
    }

    pub async fn reflection_base_hours(&self) -> Result<f64, StoreError> {
        Ok(self.number(keys::REFLECTION_BASE_HOURS, 24.0).await?.clamp(0.0, MAX_HOURS))
    }

    pub async fn self_improve_interval_hours(&self) -> Result<f64, StoreError> {
        Ok(self.number(keys::SELF_IMPROVE_INTERVAL_HOURS, 24.0).await?.clamp(0.0, MAX_HOURS))
    }

    /// Source tag fragment -> viability multiplier
    pub async fn source_weights(&self) -> Result<HashMap<String, f64>, StoreError> {
        let Some(value) = self.source.get(keys::SOURCE_WEIGHTS).await? else {
            return Ok(HashMap::new());
        };
        let Some(map) = value.as_object() else {
            warn!(value = %value, "source_weights is not an object, ignoring");
            return Ok(HashMap::new());
        };
        Ok(map
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|w| (k.clone(), w)))
            .collect())
    }
}

/// Upper bound for day-valued keys (ten years)
pub const MAX_DAYS: f64 = 3650.0;
/// Upper bound for hour-valued keys (ten years)
pub const MAX_HOURS: f64 = MAX_DAYS * 24.0;
const MAX_VALIDATION_SLOTS: f64 = 1000.0;

/// Weight for a source tag: case-insensitive substring match, the longest
/// matching key wins, 1.0 when nothing matches.
pub fn source_weight(weights: &HashMap<String, f64>, source: &str) -> f64 {
    let source = source.to_lowercase();
    weights
        .iter()
        .filter(|(key, _)| !key.is_empty() && source.contains(&key.to_lowercase()))
        .max_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| b.0.cmp(a.0)))
        .map(|(_, weight)| *weight)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let policy = Policy::in_memory();
        assert_eq!(policy.viability_floor().await.unwrap(), 40.0);
        assert_eq!(policy.max_concurrent_validations().await.unwrap(), 3);
        assert_eq!(policy.zombie_days().await.unwrap(), 14);
        assert!(policy.source_weights().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_are_fresh() {
        let policy = Policy::in_memory();
        assert_eq!(policy.pursue_threshold().await.unwrap(), 70.0);
        policy.set(keys::PURSUE_THRESHOLD, json!(55)).await.unwrap();
        assert_eq!(policy.pursue_threshold().await.unwrap(), 55.0);
    }

    #[tokio::test]
    async fn test_malformed_value_falls_back() {
        let policy = Policy::in_memory();
        policy.set(keys::ZOMBIE_DAYS, json!("two weeks")).await.unwrap();
        assert_eq!(policy.zombie_days().await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_huge_durations_are_capped() {
        let policy = Policy::in_memory();
        policy.set(keys::ZOMBIE_DAYS, json!(1e18)).await.unwrap();
        policy.set(keys::VALIDATION_WINDOW_DAYS, json!(-5)).await.unwrap();
        policy.set(keys::REFLECTION_BASE_HOURS, json!(1e18)).await.unwrap();
        policy.set(keys::SELF_IMPROVE_INTERVAL_HOURS, json!(9e300)).await.unwrap();
        policy.set(keys::MAX_CONCURRENT_VALIDATIONS, json!(1e18)).await.unwrap();

        let zombie_days = policy.zombie_days().await.unwrap();
        assert_eq!(zombie_days, 3650);
        assert_eq!(policy.validation_window_days().await.unwrap(), 0);
        assert_eq!(policy.reflection_base_hours().await.unwrap(), MAX_HOURS);
        assert_eq!(policy.self_improve_interval_hours().await.unwrap(), MAX_HOURS);
        assert_eq!(policy.max_concurrent_validations().await.unwrap(), 1000);

        // Clamped values stay inside chrono's range
        let now = chrono::Utc::now();
        assert!(now.checked_sub_signed(chrono::Duration::days(zombie_days)).is_some());
    }

    #[tokio::test]
    async fn test_store_policy_persists() {
        let store = Store::open_in_memory().unwrap();
        let policy = Policy::from_store(store.clone());
        policy
            .set(keys::SOURCE_WEIGHTS, json!({ "reddit": 0.5 }))
            .await
            .unwrap();

        let reread = Policy::from_store(store);
        let weights = reread.source_weights().await.unwrap();
        assert_eq!(weights.get("reddit"), Some(&0.5));

        let effective = reread.effective().await.unwrap();
        assert_eq!(effective.len(), keys::ALL.len());
    }

    #[test]
    fn test_source_weight_matching() {
        let weights: HashMap<String, f64> = [
            ("Reddit".to_string(), 0.5),
            ("reddit/r/saas".to_string(), 1.5),
        ]
        .into_iter()
        .collect();

        assert_eq!(source_weight(&weights, "REDDIT/r/SaaS/top"), 1.5);
        assert_eq!(source_weight(&weights, "reddit/r/rust"), 0.5);
        assert_eq!(source_weight(&weights, "hn"), 1.0);
    }
}
