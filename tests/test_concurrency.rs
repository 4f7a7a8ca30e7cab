mod common;

use loanflow::operations::{OrderCredit, OrderFlood};
use loanflow::record::DocumentType;
use loanflow::{Document, ExternalSystems, Operation, SimulatedSystem, TaskContext};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_lost_updates() {
    let dir = TempDir::new().unwrap();
    let files = common::manager_with_loan(&dir, "LN-8001").await;

    let mut handles = Vec::new();
    for i in 0..24 {
        let files = files.clone();
        handles.push(tokio::spawn(async move {
            files
                .update("LN-8001", |file| {
                    let doc = Document::approved(DocumentType::Other(format!("exhibit {}", i)), "tester");
                    let id = file.add_document(doc)?.document_id.clone();
                    file.add_flag(format!("writer {}", i));
                    Ok(id)
                })
                .await
        }));
    }

    let mut ids = BTreeSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }

    let file = files.snapshot("LN-8001").await.unwrap();
    assert_eq!(ids.len(), 24);
    assert_eq!(file.documents.len(), 24);
    assert_eq!(file.flags.len(), 24);
    let stored: BTreeSet<String> = file.documents.iter().map(|d| d.document_id.clone()).collect();
    assert_eq!(stored, ids);
    assert_eq!(files.store().write_count("LN-8001"), 25);
}

#[tokio::test]
async fn test_slow_task_does_not_erase_fast_sibling() {
    let dir = TempDir::new().unwrap();
    let files = common::manager_with_loan(&dir, "LN-8002").await;

    let mut systems = ExternalSystems::instant();
    systems.flood = Arc::new(
        SimulatedSystem::flood_certification()
            .instant()
            .with_fixed_latency(Duration::from_millis(300)),
    );
    let ctx = TaskContext::new(files.clone(), systems);

    let slow_ctx = ctx.clone();
    let slow = tokio::spawn(async move { OrderFlood.run(&slow_ctx, "LN-8002", &Value::Null).await });

    // The fast task lands while the slow one is waiting on its outside call
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = OrderCredit.run(&ctx, "LN-8002", &Value::Null).await.unwrap();
    assert!(fast.is_completed());
    let midway = files.snapshot("LN-8002").await.unwrap();
    assert_eq!(midway.documents.len(), 1);

    assert!(slow.await.unwrap().unwrap().is_completed());

    let file = files.snapshot("LN-8002").await.unwrap();
    let types: BTreeSet<DocumentType> = file.documents.iter().map(|d| d.document_type.clone()).collect();
    assert!(types.contains(&DocumentType::CreditReport));
    assert!(types.contains(&DocumentType::FloodCertification));
    assert!(file.borrower.credit_score.is_some());
    assert!(file.property.flood_zone.is_some());
    assert!(file
        .audit_trail
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_lock_is_not_held_during_outside_calls() {
    let dir = TempDir::new().unwrap();
    let files = common::manager_with_loan(&dir, "LN-8003").await;

    let mut systems = ExternalSystems::instant();
    systems.flood = Arc::new(
        SimulatedSystem::flood_certification()
            .instant()
            .with_fixed_latency(Duration::from_millis(400)),
    );
    let ctx = TaskContext::new(files.clone(), systems);
    let slow_ctx = ctx.clone();
    let slow = tokio::spawn(async move { OrderFlood.run(&slow_ctx, "LN-8003", &Value::Null).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    files
        .update("LN-8003", |file| {
            file.add_flag("written while flood check is out");
            Ok(())
        })
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    slow.await.unwrap().unwrap();
    let file = files.snapshot("LN-8003").await.unwrap();
    assert!(file.flags.iter().any(|f| f == "written while flood check is out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_loans_proceed_in_parallel() {
    let dir = TempDir::new().unwrap();
    let files = common::manager_with_loan(&dir, "LN-8004").await;
    files.create(common::loan_file("LN-8005")).await.unwrap();

    let mut systems = ExternalSystems::instant();
    systems.credit_bureau = Arc::new(
        SimulatedSystem::credit_bureau()
            .instant()
            .with_fixed_latency(Duration::from_millis(200)),
    );
    let ctx = TaskContext::new(files.clone(), systems);

    let started = Instant::now();
    let (a, b) = tokio::join!(
        OrderCredit.run(&ctx, "LN-8004", &Value::Null),
        OrderCredit.run(&ctx, "LN-8005", &Value::Null),
    );
    assert!(a.unwrap().is_completed());
    assert!(b.unwrap().is_completed());
    assert!(started.elapsed() < Duration::from_millis(380));
}
