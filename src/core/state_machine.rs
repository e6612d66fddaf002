//! Opportunity lifecycle.
//!
//! Status is never written directly. Every change appends an
//! [`OpportunityEvent`] inside an IMMEDIATE transaction that first reads the
//! latest status and validates the edge, so two loops racing on the same
//! opportunity serialize on the write lock and the loser sees the winner's
//! status.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    InvalidTransition, NewOpportunity, Opportunity, OpportunityEvent, OpportunityStatus, Rating,
    SystemEventKind,
};
use crate::policy::{source_weight, Policy};
use crate::store::{events, opportunities, validations, Store, StoreError};

/// Errors from status changes
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Invalid(#[from] InvalidTransition),

    #[error("Opportunity not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate and append a transition on an open connection.
///
/// With `expected` set, returns `Ok(None)` when the current status differs
/// (a lost race, not an error). Otherwise returns the previous status.
pub(crate) fn apply_transition(
    conn: &Connection,
    id: Uuid,
    expected: Option<OpportunityStatus>,
    to: OpportunityStatus,
    payload: &Value,
    at: DateTime<Utc>,
) -> Result<Option<OpportunityStatus>, TransitionError> {
    let (current, _) =
        opportunities::latest_status(conn, id)?.ok_or(TransitionError::NotFound(id))?;

    if let Some(expected) = expected {
        if current != expected {
            return Ok(None);
        }
    }

    current.check_transition(to)?;
    opportunities::append_event(conn, id, to, payload, at)?;
    Ok(Some(current))
}

/// Event-sourced opportunity state machine
#[derive(Clone)]
pub struct OpportunityMachine {
    store: Store,
    policy: Policy,
}

impl OpportunityMachine {
    pub fn new(store: Store, policy: Policy) -> Self {
        Self { store, policy }
    }

    /// Insert a sensor finding as `new`
    pub async fn insert(&self, new: NewOpportunity) -> Result<Opportunity, StoreError> {
        self.insert_at(new, Utc::now()).await
    }

    pub async fn insert_at(
        &self,
        new: NewOpportunity,
        now: DateTime<Utc>,
    ) -> Result<Opportunity, StoreError> {
        self.store
            .transaction(move |conn| opportunities::insert(conn, &new, now))
            .await
    }

    /// Move an opportunity to `to`. Returns the previous status.
    pub async fn transition(
        &self,
        id: Uuid,
        to: OpportunityStatus,
        payload: Value,
    ) -> Result<OpportunityStatus, TransitionError> {
        self.transition_at(id, to, payload, Utc::now()).await
    }

    pub async fn transition_at(
        &self,
        id: Uuid,
        to: OpportunityStatus,
        payload: Value,
        at: DateTime<Utc>,
    ) -> Result<OpportunityStatus, TransitionError> {
        let previous = self
            .store
            .transaction(move |conn| apply_transition(conn, id, None, to, &payload, at))
            .await?
            .ok_or(TransitionError::NotFound(id))?;

        debug!(opportunity_id = %id, from = %previous, to = %to, "Transition");
        Ok(previous)
    }

    /// Compare-and-swap: only moves `expected -> to`. `Ok(false)` means the
    /// opportunity was no longer in `expected`.
    pub async fn transition_from(
        &self,
        id: Uuid,
        expected: OpportunityStatus,
        to: OpportunityStatus,
        payload: Value,
    ) -> Result<bool, TransitionError> {
        let now = Utc::now();
        let applied = self
            .store
            .transaction(move |conn| apply_transition(conn, id, Some(expected), to, &payload, now))
            .await?;

        if applied.is_none() {
            debug!(opportunity_id = %id, expected = %expected, to = %to, "Transition lost race");
        }
        Ok(applied.is_some())
    }

    /// Pick the best `new` candidate and move it to `reviewing` in the same
    /// transaction, so concurrent selectors never pick the same row.
    #[instrument(skip(self))]
    pub async fn select_top(&self) -> Result<Option<Opportunity>, TransitionError> {
        self.select_top_at(Utc::now()).await
    }

    pub async fn select_top_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Opportunity>, TransitionError> {
        let floor = self.policy.viability_floor().await?;
        let weights = self.policy.source_weights().await?;

        let selected = self
            .store
            .transaction(move |conn| select_in(conn, floor, &weights, now))
            .await?;

        if let Some(opp) = &selected {
            info!(
                opportunity_id = %opp.id,
                title = %opp.title,
                viability = opp.scores.viability,
                weighted = opp.scores.weighted_viability,
                "Selected opportunity"
            );
        }
        Ok(selected)
    }

    /// Kill every `building` opportunity older than `zombie_days` without a
    /// converted validation. Returns the killed ids.
    pub async fn kill_zombies(&self) -> Result<Vec<Uuid>, TransitionError> {
        self.kill_zombies_at(Utc::now()).await
    }

    pub async fn kill_zombies_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, TransitionError> {
        let zombie_days = self.policy.zombie_days().await?;
        let cutoff = now - Duration::days(zombie_days);

        let killed = self
            .store
            .transaction(move |conn| {
                let mut killed = Vec::new();
                for opp in opportunities::stale_building(conn, cutoff)? {
                    let payload = json!({
                        "reason": "zombie",
                        "days_in_status": opp.days_in_status(now),
                    });
                    let applied = apply_transition(
                        conn,
                        opp.id,
                        Some(OpportunityStatus::Building),
                        OpportunityStatus::Killed,
                        &payload,
                        now,
                    )?;
                    if applied.is_none() {
                        continue;
                    }
                    validations::expire_for_opportunity(conn, opp.id, now)?;
                    events::record(
                        conn,
                        SystemEventKind::ZombieKilled,
                        Some(&opp.id.to_string()),
                        &payload,
                        now,
                    )?;
                    killed.push(opp.id);
                }
                Ok::<_, TransitionError>(killed)
            })
            .await?;

        for id in &killed {
            info!(opportunity_id = %id, zombie_days, "Killed zombie opportunity");
        }
        Ok(killed)
    }

    /// Record an operator rating. Status is untouched.
    pub async fn rate(&self, id: Uuid, rating: Rating) -> Result<(), StoreError> {
        self.store
            .call(move |conn| opportunities::set_rating(conn, id, rating, Utc::now()))
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Opportunity>, StoreError> {
        self.store.call(move |conn| opportunities::get(conn, id)).await
    }

    pub async fn status(&self, id: Uuid) -> Result<Option<OpportunityStatus>, StoreError> {
        self.store
            .call(move |conn| Ok(opportunities::latest_status(conn, id)?.map(|(s, _)| s)))
            .await
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<OpportunityEvent>, StoreError> {
        self.store.call(move |conn| opportunities::history(conn, id)).await
    }

    pub async fn list(&self, status: OpportunityStatus) -> Result<Vec<Opportunity>, StoreError> {
        self.store
            .call(move |conn| opportunities::list_by_status(conn, status))
            .await
    }

    pub async fn counts(&self) -> Result<HashMap<OpportunityStatus, usize>, StoreError> {
        self.store.call(opportunities::counts_by_status).await
    }
}

/// Rank every eligible candidate by weighted viability and claim the winner
pub(crate) fn select_in(
    conn: &Connection,
    floor: f64,
    weights: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> Result<Option<Opportunity>, TransitionError> {
    let mut ranked: Vec<Opportunity> = opportunities::candidates(conn, floor)?
        .into_iter()
        .map(|mut opp| {
            opp.scores.weighted_viability =
                opp.scores.viability * source_weight(weights, &opp.source);
            opp
        })
        .collect();

    // Stable: equal weighted scores keep the store order
    ranked.sort_by(|a, b| {
        b.scores
            .weighted_viability
            .partial_cmp(&a.scores.weighted_viability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let Some(mut winner) = ranked.into_iter().next() else {
        return Ok(None);
    };

    opportunities::set_weighted_viability(conn, winner.id, winner.scores.weighted_viability, now)?;
    let payload = json!({ "weighted_viability": winner.scores.weighted_viability });
    let applied = apply_transition(
        conn,
        winner.id,
        Some(OpportunityStatus::New),
        OpportunityStatus::Reviewing,
        &payload,
        now,
    )?;
    if applied.is_none() {
        return Ok(None);
    }

    winner.status = OpportunityStatus::Reviewing;
    winner.status_since = now;
    Ok(Some(winner))
}
