//! Validation/build concurrency controller.
//!
//! Each pass reaps zombies, resolves validations whose window has ended,
//! builds converted opportunities and fills free validation slots from the
//! `pursue` pool. The number of `building` opportunities without a
//! conversion never exceeds `max_concurrent_validations`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::guard::SingleFlight;
use super::state_machine::{apply_transition, OpportunityMachine, TransitionError};
use crate::adapters::Launcher;
use crate::domain::{Opportunity, OpportunityStatus, SystemEventKind, Validation, ValidationStatus};
use crate::policy::Policy;
use crate::store::{events, opportunities, validations, Store, StoreError};

/// Only validation style launched today
const VALIDATION_KIND: &str = "preorder";

/// What one controller pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerReport {
    pub zombies_killed: usize,
    pub converted: usize,
    pub expired: usize,
    pub shipped: usize,
    pub build_failures: usize,
    pub launched: usize,
    pub launch_failures: usize,
}

#[derive(Clone)]
pub struct ValidationController {
    store: Store,
    policy: Policy,
    machine: OpportunityMachine,
    launcher: Arc<dyn Launcher>,
    flight: Arc<SingleFlight>,
}

impl ValidationController {
    pub fn new(store: Store, policy: Policy, launcher: Arc<dyn Launcher>) -> Self {
        let machine = OpportunityMachine::new(store.clone(), policy.clone());
        Self {
            store,
            policy,
            machine,
            launcher,
            flight: Arc::new(SingleFlight::new()),
        }
    }

    /// Run one pass. `None` if a previous pass is still running.
    pub async fn run_once(&self) -> Result<Option<ControllerReport>> {
        self.run_once_at(Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<Option<ControllerReport>> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Previous controller pass still running, skipping");
            return Ok(None);
        };

        let mut report = ControllerReport::default();

        report.zombies_killed = self
            .machine
            .kill_zombies_at(now)
            .await
            .context("Zombie reaping failed")?
            .len();

        self.resolve_elapsed(now, &mut report)
            .await
            .context("Resolving elapsed validations failed")?;

        self.build_converted(&mut report)
            .await
            .context("Final builds failed")?;

        self.launch(now, &mut report)
            .await
            .context("Validation launches failed")?;

        if report != ControllerReport::default() {
            info!(?report, "Controller pass complete");
        }
        Ok(Some(report))
    }

    /// Converted with any payment, expired (and opportunity killed) without
    async fn resolve_elapsed(&self, now: DateTime<Utc>, report: &mut ControllerReport) -> Result<()> {
        let elapsed = self
            .store
            .call(move |conn| validations::elapsed_active(conn, now))
            .await?;

        for validation in elapsed {
            let id = validation.id;
            let resolved = self
                .store
                .transaction(move |conn| resolve_in(conn, id, now))
                .await?;
            match resolved {
                Some(ValidationStatus::Converted) => report.converted += 1,
                Some(_) => report.expired += 1,
                None => {}
            }
        }
        Ok(())
    }

    async fn build_converted(&self, report: &mut ControllerReport) -> Result<()> {
        let converted = self.store.call(validations::converted_awaiting_build).await?;

        for validation in converted {
            let Some(opp) = self.machine.get(validation.opportunity_id).await? else {
                continue;
            };

            let reason = match self.launcher.build_final(&opp).await {
                Ok(Some(artifact)) => {
                    let payload = json!({ "artifact": artifact, "validation_id": validation.id.to_string() });
                    let shipped = self
                        .machine
                        .transition_from(
                            opp.id,
                            OpportunityStatus::Building,
                            OpportunityStatus::Shipped,
                            payload,
                        )
                        .await?;
                    if shipped {
                        info!(opportunity_id = %opp.id, title = %opp.title, %artifact, "Shipped");
                        report.shipped += 1;
                    }
                    continue;
                }
                Ok(None) => "launcher produced no build".to_string(),
                Err(e) => format!("{e:#}"),
            };

            warn!(opportunity_id = %opp.id, %reason, "Final build did not complete");
            report.build_failures += 1;
            self.record_event(SystemEventKind::BuildFailed, opp.id, json!({ "reason": reason }))
                .await;
        }
        Ok(())
    }

    async fn launch(&self, now: DateTime<Utc>, report: &mut ControllerReport) -> Result<()> {
        let cap = self.policy.max_concurrent_validations().await?;
        let window_days = self.policy.validation_window_days().await?;

        let occupied = self.store.call(opportunities::count_building_unconverted).await?;
        let slots = cap.saturating_sub(occupied);
        if slots == 0 {
            debug!(cap, occupied, "No free validation slots");
            return Ok(());
        }

        let candidates = self
            .store
            .call(move |conn| opportunities::launch_candidates(conn, slots))
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut set = JoinSet::new();
        for opp in candidates {
            let launcher = Arc::clone(&self.launcher);
            set.spawn(async move {
                let result = launcher.launch_validation(&opp).await;
                (opp, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (opp, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Validation launch task panicked");
                    report.launch_failures += 1;
                    continue;
                }
            };

            let reason = match result {
                Ok(Some(artifact)) => {
                    let opened = match self.open_validation(&opp, artifact, window_days, now).await {
                        Ok(opened) => opened,
                        Err(e) => {
                            error!(opportunity_id = %opp.id, error = %e, "Failed to open validation");
                            report.launch_failures += 1;
                            self.record_event(
                                SystemEventKind::ValidationLaunchFailed,
                                opp.id,
                                json!({ "reason": format!("recording launch failed: {e}") }),
                            )
                            .await;
                            continue;
                        }
                    };
                    match opened {
                        Some(validation) => {
                            info!(
                                opportunity_id = %opp.id,
                                validation_id = %validation.id,
                                window_ends_at = %validation.window_ends_at,
                                "Validation launched"
                            );
                            report.launched += 1;
                        }
                        None => {
                            debug!(opportunity_id = %opp.id, "Opportunity left pursue during launch");
                        }
                    }
                    continue;
                }
                Ok(None) => "launcher produced no artifact".to_string(),
                Err(e) => format!("{e:#}"),
            };

            warn!(opportunity_id = %opp.id, %reason, "Validation launch failed");
            report.launch_failures += 1;
            self.record_event(
                SystemEventKind::ValidationLaunchFailed,
                opp.id,
                json!({ "reason": reason }),
            )
            .await;
        }
        Ok(())
    }

    /// `pursue -> building` and the active validation, atomically
    async fn open_validation(
        &self,
        opp: &Opportunity,
        artifact: String,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Validation>, TransitionError> {
        let id = opp.id;
        let window_ends_at = now + Duration::days(window_days);
        self.store
            .transaction(move |conn| {
                let payload = json!({ "artifact": artifact, "kind": VALIDATION_KIND });
                let moved = apply_transition(
                    conn,
                    id,
                    Some(OpportunityStatus::Pursue),
                    OpportunityStatus::Building,
                    &payload,
                    now,
                )?;
                if moved.is_none() {
                    return Ok(None);
                }
                let validation =
                    validations::create(conn, id, VALIDATION_KIND, &artifact, window_ends_at, now)?;
                Ok(Some(validation))
            })
            .await
    }

    /// Add a payment to an active validation
    pub async fn record_payment(&self, validation_id: Uuid, amount_usd: f64) -> Result<Validation> {
        record_payment(&self.store, validation_id, amount_usd).await
    }

    pub async fn validations_for(&self, opportunity_id: Uuid) -> Result<Vec<Validation>, StoreError> {
        self.store
            .call(move |conn| validations::for_opportunity(conn, opportunity_id))
            .await
    }

    async fn record_event(&self, kind: SystemEventKind, opportunity_id: Uuid, payload: serde_json::Value) {
        let result = self
            .store
            .call(move |conn| {
                events::record(conn, kind, Some(&opportunity_id.to_string()), &payload, Utc::now())
            })
            .await;
        if let Err(e) = result {
            error!(%opportunity_id, %kind, error = %e, "Failed to record event");
        }
    }
}

/// Operator/webhook entry point: add a payment to an active validation
pub async fn record_payment(store: &Store, validation_id: Uuid, amount_usd: f64) -> Result<Validation> {
    if !amount_usd.is_finite() || amount_usd <= 0.0 {
        bail!("Payment amount must be positive, got {amount_usd}");
    }

    let validation = store
        .transaction(move |conn| {
            let existing = validations::get(conn, validation_id)?
                .ok_or_else(|| StoreError::not_found("validation", validation_id))?;
            if !validations::add_payment(conn, validation_id, amount_usd)? {
                return Ok::<_, StoreError>(Err(existing.status));
            }
            validations::get(conn, validation_id)?
                .map(Ok)
                .ok_or_else(|| StoreError::not_found("validation", validation_id))
        })
        .await?;

    match validation {
        Ok(validation) => {
            info!(%validation_id, amount_usd, total = validation.payments_usd, "Payment recorded");
            Ok(validation)
        }
        Err(status) => bail!("Validation {validation_id} is {status}, not active"),
    }
}

/// Resolve one elapsed validation from its current row, so a payment that
/// landed after the caller's read still converts it. Returns the new status,
/// or `None` if it was no longer active.
fn resolve_in(
    conn: &rusqlite::Connection,
    validation_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<ValidationStatus>, TransitionError> {
    let Some(validation) = validations::get(conn, validation_id)? else {
        return Ok(None);
    };
    if validation.status != ValidationStatus::Active {
        return Ok(None);
    }

    let subject = validation.opportunity_id.to_string();
    let payload = json!({
        "validation_id": validation.id.to_string(),
        "payments_usd": validation.payments_usd,
    });

    if validation.has_payment_signal() {
        if !validations::resolve(conn, validation.id, ValidationStatus::Converted, now)? {
            return Ok(None);
        }
        events::record(conn, SystemEventKind::ValidationConverted, Some(&subject), &payload, now)?;
        return Ok(Some(ValidationStatus::Converted));
    }

    if !validations::resolve(conn, validation.id, ValidationStatus::Expired, now)? {
        return Ok(None);
    }
    let kill_payload = json!({ "reason": "validation_expired", "validation_id": validation.id.to_string() });
    apply_transition(
        conn,
        validation.opportunity_id,
        Some(OpportunityStatus::Building),
        OpportunityStatus::Killed,
        &kill_payload,
        now,
    )?;
    events::record(conn, SystemEventKind::ValidationExpired, Some(&subject), &payload, now)?;
    Ok(Some(ValidationStatus::Expired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewOpportunity;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Launches succeed unless the title contains "fail"
    #[derive(Default)]
    struct FakeLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch_validation(&self, opp: &Opportunity) -> anyhow::Result<Option<String>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if opp.title.contains("fail") {
                anyhow::bail!("deploy error");
            }
            Ok(Some(format!("https://preorder.example/{}", opp.id)))
        }

        async fn build_final(&self, opp: &Opportunity) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("https://app.example/{}", opp.id)))
        }
    }

    async fn pursued(machine: &OpportunityMachine, title: &str, viability: f64) -> Uuid {
        let opp = machine
            .insert(NewOpportunity::new(title, "hn").with_viability(viability))
            .await
            .unwrap();
        for status in [
            OpportunityStatus::Reviewing,
            OpportunityStatus::QueuedForPlanning,
            OpportunityStatus::Pursue,
        ] {
            machine.transition(opp.id, status, Value::Null).await.unwrap();
        }
        opp.id
    }

    fn setup() -> (ValidationController, OpportunityMachine, Arc<FakeLauncher>) {
        let store = Store::open_in_memory().unwrap();
        let policy = Policy::in_memory();
        let launcher = Arc::new(FakeLauncher::default());
        let controller = ValidationController::new(store.clone(), policy.clone(), launcher.clone());
        (controller, OpportunityMachine::new(store, policy), launcher)
    }

    #[tokio::test]
    async fn test_launch_respects_cap_and_failures_stay_in_pursue() {
        let (controller, machine, launcher) = setup();
        controller
            .policy
            .set(crate::policy::keys::MAX_CONCURRENT_VALIDATIONS, json!(2))
            .await
            .unwrap();

        let best = pursued(&machine, "Best", 90.0).await;
        let failing = pursued(&machine, "Will fail", 80.0).await;
        let third = pursued(&machine, "Third", 70.0).await;

        let report = controller.run_once().await.unwrap().unwrap();
        assert_eq!(report.launched, 1);
        assert_eq!(report.launch_failures, 1);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);

        assert_eq!(machine.status(best).await.unwrap(), Some(OpportunityStatus::Building));
        assert_eq!(machine.status(failing).await.unwrap(), Some(OpportunityStatus::Pursue));
        assert_eq!(machine.status(third).await.unwrap(), Some(OpportunityStatus::Pursue));

        let opened = controller.validations_for(best).await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].status, ValidationStatus::Active);
    }

    #[tokio::test]
    async fn test_paid_validation_converts_and_ships() {
        let (controller, machine, _) = setup();
        let id = pursued(&machine, "Paid", 90.0).await;

        let start = Utc::now();
        controller.run_once_at(start).await.unwrap();
        let validation = controller.validations_for(id).await.unwrap().remove(0);

        let updated = controller.record_payment(validation.id, 29.0).await.unwrap();
        assert_eq!(updated.payments_usd, 29.0);

        let after_window = validation.window_ends_at + Duration::minutes(1);
        let report = controller.run_once_at(after_window).await.unwrap().unwrap();
        assert_eq!(report.converted, 1);
        assert_eq!(report.shipped, 1);
        assert_eq!(machine.status(id).await.unwrap(), Some(OpportunityStatus::Shipped));
    }

    #[tokio::test]
    async fn test_unpaid_validation_expires_and_kills() {
        let (controller, machine, _) = setup();
        let id = pursued(&machine, "Unpaid", 90.0).await;

        controller.run_once_at(Utc::now()).await.unwrap();
        let validation = controller.validations_for(id).await.unwrap().remove(0);

        let report = controller
            .run_once_at(validation.window_ends_at + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(machine.status(id).await.unwrap(), Some(OpportunityStatus::Killed));

        let err = controller.record_payment(validation.id, 10.0).await.unwrap_err();
        assert!(err.to_string().contains("not active"));
    }

    #[tokio::test]
    async fn test_payment_after_elapsed_read_still_converts() {
        let (controller, machine, _) = setup();
        let id = pursued(&machine, "Late payer", 90.0).await;

        controller.run_once_at(Utc::now()).await.unwrap();
        let validation = controller.validations_for(id).await.unwrap().remove(0);
        let after_window = validation.window_ends_at + Duration::minutes(1);

        // The pass reads the elapsed list, then the payment lands
        let elapsed = controller
            .store
            .call(move |conn| validations::elapsed_active(conn, after_window))
            .await
            .unwrap();
        assert_eq!(elapsed.len(), 1);
        assert_eq!(elapsed[0].payments_usd, 0.0);
        controller.record_payment(validation.id, 49.0).await.unwrap();

        let read_id = elapsed[0].id;
        let resolved = controller
            .store
            .transaction(move |conn| resolve_in(conn, read_id, after_window))
            .await
            .unwrap();
        assert_eq!(resolved, Some(ValidationStatus::Converted));
        assert_eq!(machine.status(id).await.unwrap(), Some(OpportunityStatus::Building));

        let stored = controller.validations_for(id).await.unwrap().remove(0);
        assert_eq!(stored.status, ValidationStatus::Converted);
        assert_eq!(stored.payments_usd, 49.0);
    }

    /// Erases the history of "Vanishing" opportunities mid-launch, so
    /// recording their validation fails in the store
    struct VanishingLauncher {
        store: Store,
    }

    #[async_trait]
    impl Launcher for VanishingLauncher {
        async fn launch_validation(&self, opp: &Opportunity) -> anyhow::Result<Option<String>> {
            if opp.title.contains("Vanishing") {
                let id = opp.id.to_string();
                self.store
                    .call(move |conn| {
                        conn.execute("DELETE FROM opportunity_events WHERE opportunity_id = ?1", [id])
                            .map_err(StoreError::from)
                    })
                    .await?;
            }
            Ok(Some(format!("https://preorder.example/{}", opp.id)))
        }

        async fn build_final(&self, _opp: &Opportunity) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_store_failure_in_one_launch_keeps_the_others() {
        let store = Store::open_in_memory().unwrap();
        let policy = Policy::in_memory();
        let machine = OpportunityMachine::new(store.clone(), policy.clone());
        let launcher = Arc::new(VanishingLauncher { store: store.clone() });
        let controller = ValidationController::new(store.clone(), policy, launcher);

        let vanishing = pursued(&machine, "Vanishing act", 95.0).await;
        let second = pursued(&machine, "Second", 80.0).await;
        let third = pursued(&machine, "Third", 70.0).await;

        let report = controller.run_once().await.unwrap().unwrap();
        assert_eq!(report.launched, 2);
        assert_eq!(report.launch_failures, 1);
        assert_eq!(machine.status(second).await.unwrap(), Some(OpportunityStatus::Building));
        assert_eq!(machine.status(third).await.unwrap(), Some(OpportunityStatus::Building));

        let failures = store
            .call(|conn| events::recent(conn, Some(SystemEventKind::ValidationLaunchFailed), 10))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subject.as_deref(), Some(vanishing.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_payment_must_be_positive() {
        let (controller, _, _) = setup();
        assert!(controller.record_payment(Uuid::new_v4(), 0.0).await.is_err());
        assert!(controller.record_payment(Uuid::new_v4(), 5.0).await.is_err());
    }
}
