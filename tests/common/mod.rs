//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use prospector::adapters::{Generation, InferenceBackend, LogNotifier, Prompt};
use prospector::brain::{ApprovalGate, ModelRouter};
use prospector::config::{CloudConfig, CloudRoute, LocalConfig, ModelPricing};
use prospector::domain::{NewOpportunity, OpportunityStatus, TaskKind};
use prospector::{OpportunityMachine, Policy, Store};

pub const CLOUD_MODEL: &str = "cloud-test";

/// Backend answering every prompt with one canned text and token counts
pub struct FakeBackend {
    name: &'static str,
    reply: String,
    input_tokens: u64,
    output_tokens: u64,
    calls: Mutex<Vec<String>>,
    /// Each call takes a permit before answering
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
}

impl FakeBackend {
    pub fn new(name: &'static str, reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name, reply))
    }

    fn build(name: &'static str, reply: impl Into<String>) -> Self {
        Self {
            name,
            reply: reply.into(),
            input_tokens: 1_000,
            output_tokens: 2_000,
            calls: Mutex::new(Vec::new()),
            gate: None,
            delay: Duration::ZERO,
        }
    }

    /// Calls block until the returned semaphore hands out permits
    pub fn gated(name: &'static str, reply: impl Into<String>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut backend = Self::build(name, reply);
        backend.gate = Some(Arc::clone(&gate));
        (Arc::new(backend), gate)
    }

    /// Calls sleep `delay` before answering
    pub fn slow(name: &'static str, reply: impl Into<String>, delay: Duration) -> Arc<Self> {
        let mut backend = Self::build(name, reply);
        backend.delay = delay;
        Arc::new(backend)
    }

    /// Models called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn generate(&self, model: &str, _prompt: &Prompt) -> Result<Generation> {
        self.calls.lock().unwrap().push(model.to_string());
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.reply.is_empty() {
            bail!("{} is down", self.name);
        }
        Ok(Generation {
            text: self.reply.clone(),
            model: model.to_string(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// One cloud model priced at $3/$15 per million tokens: 1k in + 2k out costs $0.033
pub fn cloud_config() -> CloudConfig {
    let route = CloudRoute::new(CLOUD_MODEL, &[]);
    CloudConfig {
        routes: TaskKind::ALL
            .into_iter()
            .map(|task| (task, route.clone()))
            .collect(),
        pricing: HashMap::from([(
            CLOUD_MODEL.to_string(),
            ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        )]),
        ..CloudConfig::default()
    }
}

pub fn router(
    store: &Store,
    policy: &Policy,
    local: Arc<FakeBackend>,
    cloud: Option<Arc<FakeBackend>>,
    approval_timeout: Duration,
) -> ModelRouter {
    let gate = ApprovalGate::new(
        store.clone(),
        Arc::new(LogNotifier),
        approval_timeout,
        Duration::from_millis(10),
    );
    let router = ModelRouter::new(
        store.clone(),
        policy.clone(),
        local,
        LocalConfig::default(),
        gate,
    );
    match cloud {
        Some(cloud) => router.with_cloud(cloud, cloud_config()),
        None => router,
    }
}

/// Insert an opportunity and walk it to `target` along the happy path
pub async fn opportunity_at(
    machine: &OpportunityMachine,
    title: &str,
    viability: f64,
    target: OpportunityStatus,
) -> uuid::Uuid {
    use OpportunityStatus::*;

    let opp = machine
        .insert(NewOpportunity::new(title, "test").with_viability(viability))
        .await
        .unwrap();
    for status in [Reviewing, QueuedForPlanning, Pursue, Building] {
        if machine.status(opp.id).await.unwrap() == Some(target) {
            break;
        }
        machine.transition(opp.id, status, Value::Null).await.unwrap();
    }
    opp.id
}
