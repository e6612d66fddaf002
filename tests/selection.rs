//! Selection and Lifecycle Integration Tests
//!
//! Source-weighted selection, the transition table and recorded histories.

mod common;

use serde_json::{json, Value};

use common::opportunity_at;
use prospector::core::TransitionError;
use prospector::domain::{is_valid_history, NewOpportunity, OpportunityStatus};
use prospector::policy::keys;
use prospector::{OpportunityMachine, Policy, Store};

fn machine() -> (OpportunityMachine, Policy) {
    let store = Store::open_in_memory().unwrap();
    let policy = Policy::in_memory();
    (OpportunityMachine::new(store, policy.clone()), policy)
}

#[tokio::test]
async fn test_source_weight_demotes_top_raw_score() {
    let (machine, policy) = machine();
    policy
        .set(keys::SOURCE_WEIGHTS, json!({ "spammy": 0.1 }))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for (viability, source) in [
        (10.0, "hn"),
        (80.0, "reddit/r/saas"),
        (45.0, "hn"),
        (90.0, "Spammy-Forum"),
        (60.0, "indiehackers"),
    ] {
        let opp = machine
            .insert(NewOpportunity::new(format!("Idea {viability}"), source).with_viability(viability))
            .await
            .unwrap();
        ids.push(opp.id);
    }

    let first = machine.select_top().await.unwrap().unwrap();
    assert_eq!(first.id, ids[1]);
    assert_eq!(first.scores.weighted_viability, 80.0);
    assert_eq!(machine.status(ids[1]).await.unwrap(), Some(OpportunityStatus::Reviewing));

    let stored = machine.get(ids[1]).await.unwrap().unwrap();
    assert_eq!(stored.scores.weighted_viability, 80.0);

    // 60 beats 45 and the weighted 9; 10 is under the floor
    let second = machine.select_top().await.unwrap().unwrap();
    assert_eq!(second.id, ids[4]);
    let third = machine.select_top().await.unwrap().unwrap();
    assert_eq!(third.id, ids[2]);
    let fourth = machine.select_top().await.unwrap().unwrap();
    assert_eq!(fourth.id, ids[3]);
    assert!(machine.select_top().await.unwrap().is_none());
    assert_eq!(machine.status(ids[0]).await.unwrap(), Some(OpportunityStatus::New));
}

#[tokio::test]
async fn test_concurrent_selectors_never_share_a_winner() {
    let (machine, _) = machine();
    for i in 0..8 {
        machine
            .insert(NewOpportunity::new(format!("Idea {i}"), "hn").with_viability(50.0 + i as f64))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let machine = machine.clone();
            tokio::spawn(async move { machine.select_top().await.unwrap() })
        })
        .collect();

    let mut winners = std::collections::HashSet::new();
    for handle in handles {
        let winner = handle.await.unwrap().unwrap();
        assert!(winners.insert(winner.id));
    }
    assert_eq!(winners.len(), 8);
}

#[tokio::test]
async fn test_new_cannot_ship() {
    let (machine, _) = machine();
    let id = opportunity_at(&machine, "Invoice OCR", 70.0, OpportunityStatus::New).await;

    let err = machine
        .transition(id, OpportunityStatus::Shipped, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::Invalid(_)));

    let history = machine.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_terminal_statuses_accept_nothing() {
    let (machine, _) = machine();
    let id = opportunity_at(&machine, "Dead end", 70.0, OpportunityStatus::Pursue).await;
    machine
        .transition(id, OpportunityStatus::Discarded, json!({ "reason": "manual" }))
        .await
        .unwrap();

    for next in OpportunityStatus::ALL {
        assert!(machine.transition(id, next, Value::Null).await.is_err());
    }

    let history = machine.history(id).await.unwrap();
    assert!(is_valid_history(&history));
    assert_eq!(history.last().unwrap().status, OpportunityStatus::Discarded);
}

#[tokio::test]
async fn test_rating_is_not_a_status_change() {
    let (machine, _) = machine();
    let id = opportunity_at(&machine, "Rated", 70.0, OpportunityStatus::Reviewing).await;
    let before = machine.history(id).await.unwrap().len();

    machine.rate(id, prospector::domain::Rating::Bad).await.unwrap();

    assert_eq!(machine.history(id).await.unwrap().len(), before);
    assert_eq!(machine.status(id).await.unwrap(), Some(OpportunityStatus::Reviewing));
}
