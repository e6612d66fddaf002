//! Bounded-wait human approval for over-budget cloud calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::Notifier;
use crate::domain::{ApprovalRequest, ApprovalStatus, SystemEventKind};
use crate::store::{approvals, events, Store, StoreError};

/// How an approval wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timeout",
        }
    }
}

/// Raises approval requests and waits on them.
///
/// Only the calling request waits; nothing else in the process blocks.
#[derive(Clone)]
pub struct ApprovalGate {
    store: Store,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ApprovalGate {
    pub fn new(
        store: Store,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            timeout,
            poll_interval,
        }
    }

    /// Reuse the oldest pending request or raise a new one, then wait for a
    /// decision for at most the configured timeout.
    pub async fn request(
        &self,
        reason: &str,
        spent_usd: f64,
        budget_usd: f64,
    ) -> Result<(Uuid, ApprovalOutcome), StoreError> {
        let reason_owned = reason.to_string();
        let (request, created) = self
            .store
            .transaction(move |conn| {
                if let Some(existing) = approvals::oldest_pending(conn)? {
                    return Ok::<_, StoreError>((existing, false));
                }
                let now = Utc::now();
                let request = approvals::create(conn, &reason_owned, spent_usd, budget_usd, now)?;
                events::record(
                    conn,
                    SystemEventKind::CloudBudgetRequested,
                    Some(&request.id.to_string()),
                    &json!({ "reason": reason_owned, "spent_usd": spent_usd, "budget_usd": budget_usd }),
                    now,
                )?;
                Ok((request, true))
            })
            .await?;

        if created {
            info!(approval_id = %request.id, spent_usd, budget_usd, "Cloud budget approval requested");
            self.notifier
                .notify("Cloud budget approval needed", &describe(&request))
                .await;
        }

        let outcome = match tokio::time::timeout(self.timeout, self.wait_resolved(request.id)).await
        {
            Ok(status) => outcome_of(status?),
            Err(_) => self.expire(request.id).await?,
        };

        Ok((request.id, outcome))
    }

    /// Poll until the request leaves `pending`
    async fn wait_resolved(&self, id: Uuid) -> Result<ApprovalStatus, StoreError> {
        loop {
            let current = self.store.call(move |conn| approvals::get(conn, id)).await?;
            match current {
                Some(req) if req.status.is_resolved() => return Ok(req.status),
                Some(_) => tokio::time::sleep(self.poll_interval).await,
                None => return Err(StoreError::not_found("approval", id)),
            }
        }
    }

    /// Mark an untouched request `timeout`. An operator decision that lands
    /// in the same instant wins.
    async fn expire(&self, id: Uuid) -> Result<ApprovalOutcome, StoreError> {
        let status = self
            .store
            .transaction(move |conn| {
                if approvals::resolve(conn, id, ApprovalStatus::Timeout, Utc::now())? {
                    return Ok::<_, StoreError>(ApprovalStatus::Timeout);
                }
                approvals::get(conn, id)?
                    .map(|req| req.status)
                    .ok_or_else(|| StoreError::not_found("approval", id))
            })
            .await?;

        if status == ApprovalStatus::Timeout {
            warn!(approval_id = %id, timeout = ?self.timeout, "Approval request timed out");
        }
        Ok(outcome_of(status))
    }
}

fn outcome_of(status: ApprovalStatus) -> ApprovalOutcome {
    match status {
        ApprovalStatus::Approved => ApprovalOutcome::Approved,
        ApprovalStatus::Rejected => ApprovalOutcome::Rejected,
        ApprovalStatus::Pending | ApprovalStatus::Timeout => ApprovalOutcome::TimedOut,
    }
}

fn describe(request: &ApprovalRequest) -> String {
    format!(
        "{}\nSpent today: ${:.2} of ${:.2}\nApprove: prospector approve {}\nReject:  prospector reject {}",
        request.reason, request.spent_usd, request.budget_usd, request.id, request.id
    )
}

/// Resolve a pending request from the operator channel.
/// Returns false if it was already resolved.
pub async fn decide(store: &Store, id: Uuid, approve: bool) -> Result<bool, StoreError> {
    let status = if approve {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Rejected
    };
    store
        .call(move |conn| {
            if approvals::get(conn, id)?.is_none() {
                return Err(StoreError::not_found("approval", id));
            }
            approvals::resolve(conn, id, status, Utc::now())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LogNotifier;

    fn gate(store: &Store, timeout_ms: u64) -> ApprovalGate {
        ApprovalGate::new(
            store.clone(),
            Arc::new(LogNotifier),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_operator_approval_is_observed() {
        let store = Store::open_in_memory().unwrap();
        let gate = gate(&store, 5_000);

        let approver = {
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    let pending = store.call(approvals::pending).await.unwrap();
                    if let Some(req) = pending.first() {
                        assert!(decide(&store, req.id, true).await.unwrap());
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let (_, outcome) = gate.request("over budget", 2.1, 2.0).await.unwrap();
        approver.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn test_untouched_request_times_out() {
        let store = Store::open_in_memory().unwrap();
        let gate = gate(&store, 50);

        let (id, outcome) = gate.request("over budget", 2.1, 2.0).await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::TimedOut);

        let stored = store.call(move |conn| approvals::get(conn, id)).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Timeout);
        assert!(!decide(&store, id, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_request_is_reused() {
        let store = Store::open_in_memory().unwrap();
        let existing = store
            .call(|conn| approvals::create(conn, "earlier call", 2.0, 2.0, Utc::now()))
            .await
            .unwrap();

        let gate = gate(&store, 30);
        let (id, outcome) = gate.request("over budget", 2.0, 2.0).await.unwrap();
        assert_eq!(id, existing.id);
        assert_eq!(outcome, ApprovalOutcome::TimedOut);

        let pending = store.call(approvals::pending).await.unwrap();
        assert!(pending.is_empty());
    }
}
