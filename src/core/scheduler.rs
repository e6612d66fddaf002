//! Cycle scheduler.
//!
//! One tick runs these steps strictly in order:
//! digest, reflection, self-improvement, budget check, sensing, selection,
//! enqueue, self-check. Sensor failures and self-check problems are
//! recorded and never abort the tick; any other step error closes the cycle
//! `failed` with the error as its note.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::budget::{start_of_day, BudgetState, BudgetTracker};
use super::guard::SingleFlight;
use super::state_machine::{apply_transition, select_in, OpportunityMachine, TransitionError};
use crate::adapters::{InferenceBackend, Notifier, Reflector, Sensor};
use crate::domain::{CycleStatus, JobType, OpportunityStatus, Survival, SystemEventKind};
use crate::policy::{Policy, MAX_HOURS};
use crate::store::{approvals, cycles, events, jobs, Store, StoreError};

/// How a tick ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// A previous tick was still running; nothing was done
    Skipped,
    Completed {
        cycle_id: Uuid,
        selected: Option<Uuid>,
        job_id: Option<Uuid>,
    },
    BudgetExhausted {
        cycle_id: Uuid,
    },
    Failed {
        cycle_id: Uuid,
        error: String,
    },
}

enum StepsEnd {
    BudgetExhausted(String),
    Done {
        selected: Option<Uuid>,
        job_id: Option<Uuid>,
    },
}

#[derive(Clone)]
pub struct CycleScheduler {
    store: Store,
    policy: Policy,
    machine: OpportunityMachine,
    budget: BudgetTracker,
    notifier: Arc<dyn Notifier>,
    reflector: Arc<dyn Reflector>,
    local: Arc<dyn InferenceBackend>,
    sensors: Vec<Arc<dyn Sensor>>,
    home: PathBuf,
    flight: Arc<SingleFlight>,
}

impl CycleScheduler {
    pub fn new(
        store: Store,
        policy: Policy,
        notifier: Arc<dyn Notifier>,
        reflector: Arc<dyn Reflector>,
        local: Arc<dyn InferenceBackend>,
        home: PathBuf,
    ) -> Self {
        Self {
            machine: OpportunityMachine::new(store.clone(), policy.clone()),
            budget: BudgetTracker::new(store.clone(), policy.clone()),
            store,
            policy,
            notifier,
            reflector,
            local,
            sensors: Vec::new(),
            home,
            flight: Arc::new(SingleFlight::new()),
        }
    }

    pub fn with_sensors(mut self, sensors: Vec<Arc<dyn Sensor>>) -> Self {
        self.sensors = sensors;
        self
    }

    pub async fn tick(&self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// Run one cycle. Only a failure to open the cycle record is an `Err`.
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Previous tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let cycle = self
            .store
            .call(move |conn| cycles::open(conn, now))
            .await
            .context("Failed to open cycle")?;
        let cycle_id = cycle.id;
        info!(%cycle_id, "Cycle started");

        let (outcome, status, note) = match self.run_steps(now).await {
            Ok(StepsEnd::Done { selected, job_id }) => (
                TickOutcome::Completed {
                    cycle_id,
                    selected,
                    job_id,
                },
                CycleStatus::Success,
                None,
            ),
            Ok(StepsEnd::BudgetExhausted(note)) => {
                warn!(%cycle_id, %note, "Budget exhausted, cycle stopped");
                (
                    TickOutcome::BudgetExhausted { cycle_id },
                    CycleStatus::BudgetExhausted,
                    Some(note),
                )
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(%cycle_id, error = %message, "Cycle failed");
                (
                    TickOutcome::Failed {
                        cycle_id,
                        error: message.clone(),
                    },
                    CycleStatus::Failed,
                    Some(message),
                )
            }
        };

        let closed = self
            .store
            .call(move |conn| cycles::close(conn, cycle_id, status, note.as_deref(), Utc::now()))
            .await;
        match closed {
            Ok(_) => info!(%cycle_id, %status, "Cycle closed"),
            Err(e) => error!(%cycle_id, error = %e, "Failed to close cycle"),
        }

        Ok(outcome)
    }

    async fn run_steps(&self, now: DateTime<Utc>) -> Result<StepsEnd> {
        self.digest(now).await.context("Daily digest failed")?;
        self.reflect(now).await.context("Reflection failed")?;
        self.self_improve(now)
            .await
            .context("Self-improvement failed")?;

        let budget = self.budget.status(now).await.context("Budget check failed")?;
        if budget.state == BudgetState::Exhausted {
            return Ok(StepsEnd::BudgetExhausted(format!(
                "Spent ${:.2} of ${:.2} ceiling",
                budget.spend.all_time_usd, budget.ceiling_usd
            )));
        }

        self.sense().await;

        let lean = budget.state == BudgetState::Lean;
        let selected = self
            .select_and_enqueue(lean, now)
            .await
            .context("Selection failed")?;
        if selected.is_none() {
            debug!("No candidate above the viability floor");
        }

        self.self_check().await;

        Ok(StepsEnd::Done {
            selected: selected.map(|(id, _)| id),
            job_id: selected.map(|(_, job_id)| job_id),
        })
    }

    /// Once per UTC day
    async fn digest(&self, now: DateTime<Utc>) -> Result<()> {
        let day_start = start_of_day(now);
        let last = self
            .store
            .call(|conn| events::latest(conn, SystemEventKind::Digest))
            .await?;
        if last.is_some_and(|event| event.timestamp >= day_start) {
            return Ok(());
        }

        let counts = self.machine.counts().await?;
        let job_counts = self.store.call(jobs::counts).await?;
        let spend = self.budget.summary(now).await?;
        let pending = self.store.call(approvals::pending).await?.len();

        let mut by_status: Vec<(String, usize)> = counts
            .iter()
            .map(|(status, count)| (status.to_string(), *count))
            .collect();
        by_status.sort();

        let mut body = String::from("Opportunities:\n");
        for (status, count) in &by_status {
            body.push_str(&format!("  {status}: {count}\n"));
        }
        body.push_str(&format!(
            "Jobs: {} pending, {} in flight, {} done, {} failed\n",
            job_counts.pending,
            job_counts.in_flight(),
            job_counts.done,
            job_counts.failed
        ));
        body.push_str(&format!(
            "Spend: ${:.2} today, ${:.2} this week, ${:.2} all time\n",
            spend.today_usd, spend.week_usd, spend.all_time_usd
        ));
        body.push_str(&format!("Pending approvals: {pending}"));

        self.notifier.notify("Daily digest", &body).await;

        let payload = json!({
            "date": day_start.date_naive().to_string(),
            "opportunities": by_status.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
            "jobs": job_counts,
            "spend": spend,
            "pending_approvals": pending,
        });
        self.store
            .call(move |conn| events::record(conn, SystemEventKind::Digest, None, &payload, now))
            .await?;
        info!("Daily digest sent");
        Ok(())
    }

    /// Runs more often the worse the last assessment was
    async fn reflect(&self, now: DateTime<Utc>) -> Result<()> {
        let last = self
            .store
            .call(|conn| events::latest(conn, SystemEventKind::Reflection))
            .await?;
        let base_hours = self.policy.reflection_base_hours().await?;

        if let Some(event) = &last {
            let survival = event
                .payload
                .get("survival")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Survival>().ok())
                .unwrap_or_default();
            let interval = hours(base_hours / survival.interval_divisor());
            if now - event.timestamp < interval {
                return Ok(());
            }
        }

        let survival = self.reflector.reflect().await?;
        let payload = json!({ "survival": survival.as_str() });
        self.store
            .call(move |conn| events::record(conn, SystemEventKind::Reflection, None, &payload, now))
            .await?;
        info!(%survival, "Survival assessed");
        Ok(())
    }

    async fn self_improve(&self, now: DateTime<Utc>) -> Result<()> {
        let last = self
            .store
            .call(|conn| events::latest(conn, SystemEventKind::SelfImprovement))
            .await?;
        let interval = hours(self.policy.self_improve_interval_hours().await?);
        if last.is_some_and(|event| now - event.timestamp < interval) {
            return Ok(());
        }

        self.reflector.self_improve().await?;
        let weights = self.policy.source_weights().await?;
        let payload = json!({ "source_weights": weights });
        self.store
            .call(move |conn| {
                events::record(conn, SystemEventKind::SelfImprovement, None, &payload, now)
            })
            .await?;
        Ok(())
    }

    /// All sensors in parallel; failures are recorded, never raised
    async fn sense(&self) {
        let handles: Vec<_> = self
            .sensors
            .iter()
            .map(|sensor| {
                let name = sensor.name().to_string();
                let sensor = Arc::clone(sensor);
                (name, tokio::spawn(async move { sensor.sense().await }))
            })
            .collect();

        for (name, handle) in handles {
            let error = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => format!("Sensor task panicked: {e}"),
            };
            warn!(sensor = %name, %error, "Sensor failed");
            let payload = json!({ "error": error });
            let recorded = self
                .store
                .call(move |conn| {
                    events::record(conn, SystemEventKind::SensorFailed, Some(&name), &payload, Utc::now())
                })
                .await;
            if let Err(e) = recorded {
                error!(error = %e, "Failed to record sensor failure");
            }
        }
    }

    /// Select the best candidate and queue its plan job in one transaction:
    /// `new -> reviewing -> queued_for_planning` plus the job row. A failed
    /// enqueue rolls the selection back, so no candidate is left `reviewing`.
    async fn select_and_enqueue(
        &self,
        force_local: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<(Uuid, Uuid)>, TransitionError> {
        let floor = self.policy.viability_floor().await?;
        let weights = self.policy.source_weights().await?;

        let queued = self
            .store
            .transaction(move |conn| {
                let Some(opp) = select_in(conn, floor, &weights, now)? else {
                    return Ok::<_, TransitionError>(None);
                };
                let payload = json!({ "job_type": JobType::Plan.as_str(), "force_local": force_local });
                apply_transition(
                    conn,
                    opp.id,
                    Some(OpportunityStatus::Reviewing),
                    OpportunityStatus::QueuedForPlanning,
                    &payload,
                    now,
                )?
                .ok_or(TransitionError::NotFound(opp.id))?;

                let input = json!({
                    "opportunity_id": opp.id.to_string(),
                    "force_local": force_local,
                });
                let job_id = jobs::insert(conn, &JobType::Plan, &input, now)?;
                Ok(Some((opp, job_id)))
            })
            .await?;

        Ok(queued.map(|(opp, job_id)| {
            info!(
                opportunity_id = %opp.id,
                title = %opp.title,
                weighted = opp.scores.weighted_viability,
                %job_id,
                force_local,
                "Selected opportunity, plan job enqueued"
            );
            (opp.id, job_id)
        }))
    }

    /// Store, home directory and local backend reachability
    async fn self_check(&self) {
        let store = check(self.store.ping().await);

        let probe = self.home.join(format!(".selfcheck-{}", Uuid::new_v4().simple()));
        let home = check(async {
            tokio::fs::create_dir_all(&self.home).await?;
            tokio::fs::write(&probe, b"ok").await?;
            tokio::fs::remove_file(&probe).await
        }
        .await);

        let network = check(self.local.health_check().await);

        let healthy = store.is_none() && home.is_none() && network.is_none();
        if healthy {
            debug!("Self-check passed");
        } else {
            warn!(?store, ?home, ?network, "Self-check found problems");
        }

        let payload = json!({
            "healthy": healthy,
            "store": store,
            "home": home,
            "network": network,
        });
        let recorded = self
            .store
            .call(move |conn| {
                events::record(conn, SystemEventKind::Diagnostics, None, &payload, Utc::now())
            })
            .await;
        if let Err(e) = recorded {
            error!(error = %e, "Failed to record diagnostics");
        }
    }

    /// Cycles newest first
    pub async fn recent_cycles(&self, limit: usize) -> Result<Vec<crate::domain::Cycle>, StoreError> {
        self.store.call(move |conn| cycles::recent(conn, limit)).await
    }
}

fn hours(value: f64) -> Duration {
    let value = if value.is_finite() { value.clamp(0.0, MAX_HOURS) } else { 0.0 };
    Duration::seconds((value * 3600.0).round() as i64)
}

fn check<E: std::fmt::Display>(result: Result<(), E>) -> Option<String> {
    result.err().map(|e| e.to_string())
}
