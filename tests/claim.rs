//! Job Claim Integration Tests
//!
//! Atomic claiming across connections, plan outcomes and terminal job states.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use common::{opportunity_at, FakeBackend};
use prospector::core::{JobQueue, PollOutcome};
use prospector::domain::{JobStatus, JobType, OpportunityStatus, SystemEventKind};
use prospector::store::{events, jobs};
use prospector::{OpportunityMachine, Policy, Store};

struct Fixture {
    store: Store,
    policy: Policy,
    machine: OpportunityMachine,
}

fn fixture() -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let policy = Policy::in_memory();
    let machine = OpportunityMachine::new(store.clone(), policy.clone());
    Fixture { store, policy, machine }
}

impl Fixture {
    fn queue(&self, local: Arc<FakeBackend>, concurrency: usize) -> JobQueue {
        let router = common::router(&self.store, &self.policy, local, None, Duration::from_millis(50));
        JobQueue::new(self.store.clone(), self.policy.clone(), Arc::new(router), concurrency)
    }

    /// An opportunity waiting for its plan, and the plan job for it
    async fn plan_job(&self, queue: &JobQueue, title: &str) -> (Uuid, Uuid) {
        let id = opportunity_at(&self.machine, title, 60.0, OpportunityStatus::QueuedForPlanning).await;
        let job_id = queue
            .enqueue(JobType::Plan, json!({ "opportunity_id": id.to_string() }))
            .await
            .unwrap();
        (id, job_id)
    }
}

#[tokio::test]
async fn test_poll_claims_up_to_concurrency() {
    let f = fixture();
    let (local, gate) = FakeBackend::gated("local", r#"{"score": 80, "plan": "Landing page first"}"#);
    let queue = f.queue(local.clone(), 2);

    let mut job_ids = Vec::new();
    for i in 0..3 {
        job_ids.push(f.plan_job(&queue, &format!("Idea {i}")).await.1);
    }

    let poller = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.poll_once().await.unwrap() })
    };

    // Both claimed jobs are waiting on the backend
    while local.calls().len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.locked + counts.running, 2);
    assert_eq!(counts.pending, 1);

    let mut claimed = 0;
    for id in &job_ids {
        let job = queue.get(*id).await.unwrap().unwrap();
        if job.status == JobStatus::Pending {
            assert!(job.claimed_by.is_none());
        } else {
            assert_eq!(job.claimed_by.as_deref(), Some(queue.worker_id()));
            claimed += 1;
        }
    }
    assert_eq!(claimed, 2);

    gate.add_permits(2);
    assert_eq!(
        poller.await.unwrap(),
        PollOutcome::Polled {
            claimed: 2,
            done: 2,
            failed: 0
        }
    );

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.pending, 1);
    assert_eq!(local.calls().len(), 2);
}

#[tokio::test]
async fn test_plain_text_score_still_decides() {
    let f = fixture();
    let queue = f.queue(FakeBackend::new("local", "Score: 75 looks good"), 1);
    let (id, job_id) = f.plan_job(&queue, "Churn dashboard").await;

    assert_eq!(
        queue.poll_once().await.unwrap(),
        PollOutcome::Polled {
            claimed: 1,
            done: 1,
            failed: 0
        }
    );

    assert_eq!(f.machine.status(id).await.unwrap(), Some(OpportunityStatus::Pursue));
    let opp = f.machine.get(id).await.unwrap().unwrap();
    assert_eq!(opp.plan.as_deref(), Some("Score: 75 looks good"));

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    let output = job.output.unwrap();
    assert_eq!(output["fallback"], true);
    assert_eq!(output["score"], 75.0);

    let fallbacks = f
        .store
        .call(|conn| events::recent(conn, Some(SystemEventKind::PlanParseFallback), 10))
        .await
        .unwrap();
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].subject.as_deref(), Some(job_id.to_string().as_str()));
    assert_eq!(fallbacks[0].payload["opportunity_id"], id.to_string());
}

#[tokio::test]
async fn test_unscored_plan_fails_job_and_errors_opportunity() {
    let f = fixture();
    let queue = f.queue(FakeBackend::new("local", "I would need more data before rating this."), 1);
    let (id, job_id) = f.plan_job(&queue, "Vague idea").await;

    assert_eq!(
        queue.poll_once().await.unwrap(),
        PollOutcome::Polled {
            claimed: 1,
            done: 0,
            failed: 1
        }
    );

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("No score"));
    assert!(job.finished_at.is_some());

    assert_eq!(f.machine.status(id).await.unwrap(), Some(OpportunityStatus::Error));

    let failures = f
        .store
        .call(|conn| events::recent(conn, Some(SystemEventKind::JobFailed), 10))
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].subject.as_deref(), Some(job_id.to_string().as_str()));
    assert_eq!(failures[0].payload["job_type"], "plan");

    let fallbacks = f
        .store
        .call(|conn| events::recent(conn, Some(SystemEventKind::PlanParseFallback), 10))
        .await
        .unwrap();
    assert!(fallbacks.is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("agent.db");

    let seed = Store::open(&path).unwrap();
    for i in 0..40 {
        seed.call(move |conn| jobs::insert(conn, &JobType::Score, &json!({ "n": i }), Utc::now()))
            .await
            .unwrap();
    }

    // Each worker gets its own connection to the same file
    let mut handles = Vec::new();
    for w in 0..4 {
        let store = Store::open(&path).unwrap();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut mine = Vec::new();
            loop {
                let name = worker.clone();
                let batch = store
                    .transaction(move |conn| jobs::claim(conn, 3, &name, Utc::now()))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|job| job.id));
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
            total += 1;
        }
    }
    assert_eq!(total, 40);

    let counts = seed.call(jobs::counts).await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.locked, 40);
}

#[tokio::test]
async fn test_every_claimed_job_ends_terminal() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("agent.db");
    let seed = Store::open(&path).unwrap();
    let policy = Policy::from_store(seed.clone());
    let machine = OpportunityMachine::new(seed.clone(), policy.clone());

    let mut opportunity_ids = Vec::new();
    for i in 0..6 {
        let id = opportunity_at(
            &machine,
            &format!("Idea {i}"),
            60.0,
            OpportunityStatus::QueuedForPlanning,
        )
        .await;
        opportunity_ids.push(id);
    }

    // Three pollers on separate connections share the queue
    let mut queues = Vec::new();
    for _ in 0..3 {
        let store = Store::open(&path).unwrap();
        let policy = Policy::from_store(store.clone());
        let local = FakeBackend::new("local", r#"{"score": 85, "plan": "Ship a landing page"}"#);
        let router = common::router(&store, &policy, local, None, Duration::from_millis(50));
        queues.push(JobQueue::new(store, policy, Arc::new(router), 2));
    }

    for id in &opportunity_ids {
        queues[0]
            .enqueue(JobType::Plan, json!({ "opportunity_id": id.to_string() }))
            .await
            .unwrap();
    }
    queues[0]
        .enqueue(JobType::from("summarize"), json!({}))
        .await
        .unwrap();
    queues[0]
        .enqueue(JobType::Plan, json!({ "no": "opportunity" }))
        .await
        .unwrap();

    let handles: Vec<_> = queues
        .into_iter()
        .map(|queue| {
            tokio::spawn(async move {
                loop {
                    match queue.poll_once().await.unwrap() {
                        PollOutcome::Polled { claimed: 0, .. } => break,
                        _ => tokio::task::yield_now().await,
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let counts = seed.call(jobs::counts).await.unwrap();
    assert_eq!(counts.done, 6);
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.in_flight(), 0);
    assert_eq!(counts.pending, 0);

    for id in opportunity_ids {
        assert_eq!(machine.status(id).await.unwrap(), Some(OpportunityStatus::Pursue));
        let opp = machine.get(id).await.unwrap().unwrap();
        assert_eq!(opp.plan.as_deref(), Some("Ship a landing page"));
    }
}
