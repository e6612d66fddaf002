//! Job queue and worker pool.
//!
//! `enqueue` never waits for a result. A poller claims up to `concurrency`
//! pending jobs in one atomic UPDATE and processes them concurrently. Every
//! claimed job ends `done` or `failed`, including when its handler errors or
//! panics.

use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::guard::SingleFlight;
use super::state_machine::{apply_transition, OpportunityMachine, TransitionError};
use crate::brain::{BrainRequest, ModelRouter};
use crate::domain::{
    Job, JobCounts, JobStatus, JobType, Opportunity, OpportunityStatus, Scores, SystemEventKind,
    TaskKind,
};
use crate::policy::Policy;
use crate::store::{events, jobs, opportunities, Store, StoreError};

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous poll was still running
    Skipped,
    Polled {
        claimed: usize,
        done: usize,
        failed: usize,
    },
}

/// Score and plan extracted from a planning answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanVerdict {
    pub score: f64,
    pub plan: String,
    /// Strict JSON parsing failed; the score came from pattern matching
    pub fallback: bool,
}

struct JobSuccess {
    output: Value,
    cost_usd: f64,
}

struct JobFailure {
    error: anyhow::Error,
    cost_usd: f64,
}

impl JobFailure {
    fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            cost_usd: 0.0,
        }
    }

    fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    policy: Policy,
    brain: Arc<ModelRouter>,
    machine: OpportunityMachine,
    concurrency: usize,
    worker_id: String,
    flight: Arc<SingleFlight>,
}

impl JobQueue {
    pub fn new(store: Store, policy: Policy, brain: Arc<ModelRouter>, concurrency: usize) -> Self {
        let machine = OpportunityMachine::new(store.clone(), policy.clone());
        Self {
            store,
            policy,
            brain,
            machine,
            concurrency: concurrency.max(1),
            worker_id: format!("worker-{}-{}", std::process::id(), Uuid::new_v4().simple()),
            flight: Arc::new(SingleFlight::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Insert a `pending` job and return its id immediately
    pub async fn enqueue(&self, job_type: JobType, input: Value) -> Result<Uuid, StoreError> {
        let id = self
            .store
            .call(move |conn| jobs::insert(conn, &job_type, &input, Utc::now()))
            .await?;
        debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Atomically move up to `limit` pending jobs to `locked`
    pub async fn claim(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let worker = self.worker_id.clone();
        self.store
            .transaction(move |conn| jobs::claim(conn, limit, &worker, Utc::now()))
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.store.call(move |conn| jobs::get(conn, id)).await
    }

    pub async fn counts(&self) -> Result<JobCounts, StoreError> {
        self.store.call(jobs::counts).await
    }

    /// Claim up to `concurrency` jobs and process them concurrently,
    /// returning once all of them are terminal.
    #[instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn poll_once(&self) -> Result<PollOutcome, StoreError> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Previous poll still running, skipping");
            return Ok(PollOutcome::Skipped);
        };

        let claimed = self.claim(self.concurrency).await?;
        let count = claimed.len();
        if count > 0 {
            info!(claimed = count, "Claimed jobs");
        }

        let handles: Vec<_> = claimed
            .into_iter()
            .map(|job| {
                let queue = self.clone();
                let id = job.id;
                (id, tokio::spawn(async move { queue.process(job).await }))
            })
            .collect();

        let (mut done, mut failed) = (0, 0);
        for (id, handle) in handles {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) => {
                    error!(job_id = %id, error = %e, "Job task panicked");
                    self.fail_job(id, &format!("Worker task panicked: {e}"), 0.0)
                        .await
                }
            };
            match status {
                Some(JobStatus::Done) => done += 1,
                Some(JobStatus::Failed) => failed += 1,
                _ => {}
            }
        }

        Ok(PollOutcome::Polled {
            claimed: count,
            done,
            failed,
        })
    }

    /// Run one claimed job to a terminal state. `None` if the job was no
    /// longer ours or the final write failed.
    async fn process(&self, job: Job) -> Option<JobStatus> {
        let id = job.id;
        let running = self
            .store
            .call(move |conn| jobs::mark_running(conn, id, Utc::now()))
            .await;

        let result = match running {
            Ok(true) => self.dispatch(&job).await,
            Ok(false) => {
                warn!(job_id = %id, "Job is no longer locked by this worker");
                return None;
            }
            Err(e) => Err(JobFailure::new(e)),
        };

        match result {
            Ok(success) => {
                let output = success.output;
                let cost = success.cost_usd;
                match self
                    .store
                    .call(move |conn| jobs::complete(conn, id, &output, cost, Utc::now()))
                    .await
                {
                    Ok(true) => {
                        info!(job_id = %id, job_type = %job.job_type, cost_usd = cost, "Job done");
                        Some(JobStatus::Done)
                    }
                    Ok(false) => {
                        warn!(job_id = %id, "Job already terminal");
                        None
                    }
                    Err(e) => {
                        error!(job_id = %id, error = %e, "Failed to record job result");
                        self.fail_job(id, &format!("Failed to record result: {e}"), cost)
                            .await
                    }
                }
            }
            Err(failure) => {
                let message = format!("{:#}", failure.error);
                warn!(job_id = %id, job_type = %job.job_type, error = %message, "Job failed");
                let status = self.fail_job(id, &message, failure.cost_usd).await;
                self.after_failure(&job, &message).await;
                status
            }
        }
    }

    async fn fail_job(&self, id: Uuid, message: &str, cost: f64) -> Option<JobStatus> {
        let message = message.to_string();
        match self
            .store
            .call(move |conn| jobs::fail(conn, id, &message, cost, Utc::now()))
            .await
        {
            Ok(true) => Some(JobStatus::Failed),
            Ok(false) => None,
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to mark job failed");
                None
            }
        }
    }

    /// Failure side effects: the event log and, for plan jobs, `error` status
    async fn after_failure(&self, job: &Job, message: &str) {
        let id = job.id;
        let payload = json!({ "job_type": job.job_type.as_str(), "error": message });
        if let Err(e) = self
            .store
            .call(move |conn| {
                events::record(
                    conn,
                    SystemEventKind::JobFailed,
                    Some(&id.to_string()),
                    &payload,
                    Utc::now(),
                )
            })
            .await
        {
            error!(job_id = %id, error = %e, "Failed to record job failure event");
        }

        if job.job_type != JobType::Plan {
            return;
        }
        let Some(opportunity_id) = job.opportunity_id() else {
            return;
        };
        let payload = json!({ "job_id": id.to_string(), "error": message });
        match self
            .machine
            .transition_from(
                opportunity_id,
                OpportunityStatus::QueuedForPlanning,
                OpportunityStatus::Error,
                payload,
            )
            .await
        {
            Ok(true) => info!(%opportunity_id, "Opportunity moved to error"),
            Ok(false) => {}
            Err(e) => error!(%opportunity_id, error = %e, "Failed to move opportunity to error"),
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<JobSuccess, JobFailure> {
        match &job.job_type {
            JobType::Plan => self.run_plan(job).await,
            JobType::Score => self.run_score(job).await,
            JobType::Other(name) => Err(JobFailure::new(anyhow!("Unknown job type: {name}"))),
        }
    }

    async fn load_opportunity(&self, job: &Job) -> Result<Opportunity, JobFailure> {
        let id = job
            .opportunity_id()
            .ok_or_else(|| JobFailure::new(anyhow!("Job input has no opportunity_id")))?;
        self.machine
            .get(id)
            .await
            .map_err(JobFailure::new)?
            .ok_or_else(|| JobFailure::new(anyhow!("Opportunity not found: {id}")))
    }

    async fn run_plan(&self, job: &Job) -> Result<JobSuccess, JobFailure> {
        let opp = self.load_opportunity(job).await?;
        let request = BrainRequest::new(TaskKind::Planning, plan_prompt(&opp))
            .force_local(job.force_local())
            .max_tokens(2048);
        let response = self.brain.call(request).await.map_err(JobFailure::new)?;
        let cost = response.cost_usd;

        let verdict = parse_plan(&response.text).ok_or_else(|| {
            JobFailure::new(anyhow!("No score found in planning output")).with_cost(cost)
        })?;

        if verdict.fallback {
            warn!(job_id = %job.id, score = verdict.score, "Plan output was not valid JSON, used fallback score");
            let job_id = job.id;
            let payload = json!({
                "opportunity_id": opp.id.to_string(),
                "score": verdict.score,
                "raw": truncate(&response.text, 500),
            });
            if let Err(e) = self
                .store
                .call(move |conn| {
                    events::record(
                        conn,
                        SystemEventKind::PlanParseFallback,
                        Some(&job_id.to_string()),
                        &payload,
                        Utc::now(),
                    )
                })
                .await
            {
                error!(job_id = %job.id, error = %e, "Failed to record parse fallback event");
            }
        }

        let threshold = self
            .policy
            .pursue_threshold()
            .await
            .map_err(|e| JobFailure::new(e).with_cost(cost))?;
        let next = if verdict.score >= threshold {
            OpportunityStatus::Pursue
        } else {
            OpportunityStatus::Discarded
        };

        let opp_id = opp.id;
        let plan = verdict.plan.clone();
        let payload = json!({ "job_id": job.id.to_string(), "score": verdict.score, "threshold": threshold });
        let applied = self
            .store
            .transaction(move |conn| {
                let now = Utc::now();
                opportunities::set_plan(conn, opp_id, &plan, now)?;
                apply_transition(
                    conn,
                    opp_id,
                    Some(OpportunityStatus::QueuedForPlanning),
                    next,
                    &payload,
                    now,
                )
            })
            .await
            .map_err(|e: TransitionError| JobFailure::new(e).with_cost(cost))?;

        if applied.is_some() {
            info!(opportunity_id = %opp_id, score = verdict.score, threshold, decision = %next, "Plan scored");
        } else {
            warn!(opportunity_id = %opp_id, "Opportunity left queued_for_planning before the plan landed");
        }

        Ok(JobSuccess {
            output: json!({
                "score": verdict.score,
                "plan": verdict.plan,
                "fallback": verdict.fallback,
                "decision": applied.map(|_| next.as_str()),
                "model": response.model,
                "backend": response.backend,
            }),
            cost_usd: cost,
        })
    }

    async fn run_score(&self, job: &Job) -> Result<JobSuccess, JobFailure> {
        let opp = self.load_opportunity(job).await?;
        let request = BrainRequest::new(TaskKind::Scoring, score_prompt(&opp))
            .force_local(job.force_local())
            .max_tokens(512);
        let response = self.brain.call(request).await.map_err(JobFailure::new)?;
        let cost = response.cost_usd;

        let scores = parse_scores(&response.text, opp.scores).ok_or_else(|| {
            JobFailure::new(anyhow!("Scoring output is not a JSON score object")).with_cost(cost)
        })?;

        let opp_id = opp.id;
        self.store
            .call(move |conn| opportunities::set_scores(conn, opp_id, &scores, Utc::now()))
            .await
            .map_err(|e| JobFailure::new(e).with_cost(cost))?;

        Ok(JobSuccess {
            output: json!({ "scores": scores, "model": response.model }),
            cost_usd: cost,
        })
    }
}

fn plan_prompt(opp: &Opportunity) -> String {
    format!(
        "You are evaluating a business opportunity.\n\n\
         Title: {}\nSource: {}\nViability: {:.0}\nPain: {:.0}\nWillingness to pay: {:.0}\nCompetition: {:.0}\n\n\
         Evidence:\n{}\n\n\
         Write a short, concrete plan to validate and build this. Then rate how worth pursuing it is \
         from 0 to 100.\n\
         Respond with JSON only: {{\"score\": <0-100>, \"plan\": \"<plan>\"}}",
        opp.title,
        opp.source,
        opp.scores.viability,
        opp.scores.pain,
        opp.scores.willingness_to_pay,
        opp.scores.competition,
        truncate(&opp.evidence, 4000),
    )
}

fn score_prompt(opp: &Opportunity) -> String {
    format!(
        "Score this business opportunity from 0 to 100 on each axis.\n\n\
         Title: {}\nSource: {}\n\nEvidence:\n{}\n\n\
         Respond with JSON only: {{\"pain\": n, \"willingness_to_pay\": n, \"competition\": n, \"viability\": n}}",
        opp.title,
        opp.source,
        truncate(&opp.evidence, 4000),
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// First JSON object in `text`: the whole text, or the span between the
/// first `{` and the last `}` (handles code fences and chatter)
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn score_pattern() -> Option<&'static Regex> {
    static SCORE: OnceLock<Option<Regex>> = OnceLock::new();
    SCORE
        .get_or_init(|| Regex::new(r#"(?i)\bscore\b["']?\s*[:=]?\s*["']?(\d{1,3}(?:\.\d+)?)"#).ok())
        .as_ref()
}

/// Parse a planning answer: strict JSON first, then a `score: N` pattern
pub fn parse_plan(text: &str) -> Option<PlanVerdict> {
    if let Some(value) = extract_json(text) {
        if let Some(score) = value.get("score").and_then(Value::as_f64) {
            let plan = value
                .get("plan")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Some(PlanVerdict {
                score: score.clamp(0.0, 100.0),
                plan,
                fallback: false,
            });
        }
    }

    let captures = score_pattern()?.captures(text)?;
    let score: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(PlanVerdict {
        score: score.clamp(0.0, 100.0),
        plan: text.trim().to_string(),
        fallback: true,
    })
}

/// Parse a scoring answer; axes missing from the answer keep `current`
pub fn parse_scores(text: &str, current: Scores) -> Option<Scores> {
    let value = extract_json(text)?;
    let axis = |name: &str| value.get(name).and_then(Value::as_f64).map(|n| n.clamp(0.0, 100.0));

    let viability = axis("viability")?;
    Some(Scores {
        pain: axis("pain").unwrap_or(current.pain),
        willingness_to_pay: axis("willingness_to_pay").unwrap_or(current.willingness_to_pay),
        competition: axis("competition").unwrap_or(current.competition),
        viability,
        weighted_viability: current.weighted_viability,
    })
}
