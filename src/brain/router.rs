//! Backend selection, fallback chains and spend recording.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::{
    ApprovalGate, ApprovalOutcome, Attempt, BackendKind, BrainError, BrainRequest, BrainResponse,
};
use crate::adapters::{InferenceBackend, Prompt};
use crate::config::{CloudConfig, LocalConfig};
use crate::core::BudgetTracker;
use crate::domain::{SpendRecord, SystemEventKind};
use crate::policy::Policy;
use crate::store::{events, Store};

/// Routes inference requests between the local and cloud backends
pub struct ModelRouter {
    store: Store,
    policy: Policy,
    budget: BudgetTracker,
    local: Arc<dyn InferenceBackend>,
    cloud: Option<Arc<dyn InferenceBackend>>,
    local_config: LocalConfig,
    cloud_config: CloudConfig,
    gate: ApprovalGate,
}

impl ModelRouter {
    pub fn new(
        store: Store,
        policy: Policy,
        local: Arc<dyn InferenceBackend>,
        local_config: LocalConfig,
        gate: ApprovalGate,
    ) -> Self {
        Self {
            budget: BudgetTracker::new(store.clone(), policy.clone()),
            store,
            policy,
            local,
            cloud: None,
            local_config,
            cloud_config: CloudConfig::default(),
            gate,
        }
    }

    /// Enable the metered backend
    pub fn with_cloud(mut self, cloud: Arc<dyn InferenceBackend>, config: CloudConfig) -> Self {
        self.cloud = Some(cloud);
        self.cloud_config = config;
        self
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Local backend, for reachability probes
    pub fn local_backend(&self) -> Arc<dyn InferenceBackend> {
        Arc::clone(&self.local)
    }

    /// Answer a request. Fails only when every backend in the chain failed.
    #[instrument(skip(self, request), fields(task = %request.task, force_local = request.force_local))]
    pub async fn call(&self, request: BrainRequest) -> Result<BrainResponse, BrainError> {
        let mut attempts = Vec::new();

        let Some(cloud) = self.cloud.as_ref().filter(|_| !request.force_local) else {
            return self.call_local(&request, attempts).await;
        };

        let spent = self.budget.spent_today(Utc::now()).await?;
        let budget = self.policy.daily_cloud_budget_usd().await?;

        if spent >= budget {
            let reason = format!(
                "{} request needs cloud inference but today's spend ${:.2} has reached the ${:.2} budget",
                request.task, spent, budget
            );
            let (approval_id, outcome) = self.gate.request(&reason, spent, budget).await?;

            if outcome != ApprovalOutcome::Approved {
                info!(%approval_id, outcome = outcome.as_str(), "Cloud call blocked, using local");
                let payload = json!({
                    "approval_id": approval_id.to_string(),
                    "outcome": outcome.as_str(),
                    "task": request.task.as_str(),
                    "spent_usd": spent,
                    "budget_usd": budget,
                });
                self.store
                    .call(move |conn| {
                        events::record(
                            conn,
                            SystemEventKind::CloudBudgetBlocked,
                            Some(&approval_id.to_string()),
                            &payload,
                            Utc::now(),
                        )
                    })
                    .await?;
                return self.call_local(&request, attempts).await;
            }
            info!(%approval_id, "Over-budget cloud call approved");
        }

        match self.call_cloud(cloud.as_ref(), &request, &mut attempts).await? {
            Some(response) => Ok(response),
            None => {
                warn!(task = %request.task, failures = attempts.len(), "Cloud chain failed, using local");
                let payload = json!({
                    "task": request.task.as_str(),
                    "attempts": attempts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                });
                self.store
                    .call(move |conn| {
                        events::record(conn, SystemEventKind::CloudFallback, None, &payload, Utc::now())
                    })
                    .await?;
                self.call_local(&request, attempts).await
            }
        }
    }

    /// Try the task's cloud chain in order. `Ok(None)` when every model failed.
    async fn call_cloud(
        &self,
        cloud: &dyn InferenceBackend,
        request: &BrainRequest,
        attempts: &mut Vec<Attempt>,
    ) -> Result<Option<BrainResponse>, BrainError> {
        let Some(route) = self.cloud_config.route_for(request.task) else {
            debug!(task = %request.task, "No cloud route configured");
            return Ok(None);
        };
        let prompt = prompt_of(request);

        for model in route.chain() {
            match cloud.generate(model, &prompt).await {
                Ok(generation) => {
                    let pricing = self.cloud_config.pricing_for(&generation.model);
                    let cost_usd = pricing.cost(generation.input_tokens, generation.output_tokens);
                    let record = SpendRecord {
                        task: request.task,
                        model: generation.model.clone(),
                        input_tokens: generation.input_tokens,
                        output_tokens: generation.output_tokens,
                        cost_usd,
                        recorded_at: Utc::now(),
                    };
                    // A failed ledger write never discards a paid answer
                    if let Err(e) = self.budget.record(record).await {
                        error!(model = %generation.model, cost_usd, error = %e, "Failed to record cloud spend");
                    }

                    debug!(model = %generation.model, cost_usd, "Cloud call succeeded");
                    return Ok(Some(BrainResponse {
                        text: generation.text,
                        backend: BackendKind::Cloud,
                        model: generation.model,
                        input_tokens: generation.input_tokens,
                        output_tokens: generation.output_tokens,
                        cost_usd,
                    }));
                }
                Err(e) => {
                    warn!(model, error = %e, "Cloud model failed");
                    attempts.push(Attempt {
                        backend: BackendKind::Cloud,
                        model: model.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(None)
    }

    /// Task model, then the default model. Vision requests only try the
    /// vision model.
    async fn call_local(
        &self,
        request: &BrainRequest,
        mut attempts: Vec<Attempt>,
    ) -> Result<BrainResponse, BrainError> {
        let prompt = prompt_of(request);

        let mut models = Vec::with_capacity(2);
        if prompt.has_images() {
            models.push(self.local_config.vision_model.as_str());
        } else {
            let task_model = self.local_config.model_for(request.task);
            models.push(task_model);
            if task_model != self.local_config.default_model {
                models.push(self.local_config.default_model.as_str());
            }
        }

        for model in models {
            match self.local.generate(model, &prompt).await {
                Ok(generation) => {
                    return Ok(BrainResponse {
                        text: generation.text,
                        backend: BackendKind::Local,
                        model: generation.model,
                        input_tokens: generation.input_tokens,
                        output_tokens: generation.output_tokens,
                        cost_usd: 0.0,
                    });
                }
                Err(e) => {
                    warn!(model, error = %e, "Local model failed");
                    attempts.push(Attempt {
                        backend: BackendKind::Local,
                        model: model.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(BrainError::Exhausted {
            task: request.task,
            attempts,
        })
    }
}

fn prompt_of(request: &BrainRequest) -> Prompt {
    Prompt {
        text: request.prompt.clone(),
        system: request.system.clone(),
        images: request.images.clone(),
        max_tokens: request.max_tokens,
    }
}
