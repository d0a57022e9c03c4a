//! End-to-end tests for the orchestration core
//!
//! - Majority consensus writing divergence records to a JSONL log
//! - A batch whose stages fan out through a shared rate-limited pool

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::time::Instant;
use wordsmith_coordination::{
    as_text, BatchOrchestrator, ConsensusInvoker, ItemStatus, JsonlDivergenceSink,
    MemoryDivergenceSink, ModelDescriptor, PermitBudget, RateLimitedPool,
};

fn three_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new("m1"),
        ModelDescriptor::new("m2"),
        ModelDescriptor::new("m3"),
    ]
}

#[tokio::test]
async fn majority_round_is_logged_to_jsonl() {
    let dir = tempdir().expect("Failed to create temp dir");
    let sink = Arc::new(JsonlDivergenceSink::new(dir.path().join("divergence.jsonl")));
    let invoker = ConsensusInvoker::new(sink.clone());

    let outcome = invoker
        .call_with_consensus(
            "definition",
            "ephemeral",
            &three_models(),
            |model: &ModelDescriptor| {
                let answer = if model.name == "m3" { "B" } else { "A" };
                async move { Ok::<_, String>(answer.to_string()) }
            },
            as_text,
        )
        .await
        .unwrap();
    assert_eq!(outcome.response, "A");

    // The sink write runs on a spawned task.
    let mut records = Vec::new();
    for _ in 0..100 {
        records = sink.read_all().unwrap();
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.operation_type, "definition");
    assert_eq!(record.input, "ephemeral");
    assert_eq!(record.groups.len(), 2);
    assert_eq!(record.groups[0].output, "A");
    assert_eq!(record.groups[0].models, vec!["m1", "m2"]);
    assert_eq!(record.groups[1].output, "B");
    assert_eq!(record.groups[1].models, vec!["m3"]);
    assert!(record.strict_majority);
}

#[tokio::test(start_paused = true)]
async fn batch_stages_respect_the_provider_quota() {
    let pool = RateLimitedPool::new("openai", PermitBudget::per_minute(5).unwrap())
        .unwrap()
        .shared();
    let sink = Arc::new(MemoryDivergenceSink::new());
    let invoker = ConsensusInvoker::new(sink.clone());
    let models = three_models();
    let orchestrator = BatchOrchestrator::new(2).unwrap();
    let words: Vec<String> = ["apple", "brook", "cinder", "dune"]
        .iter()
        .map(|w| w.to_string())
        .collect();

    let started = Instant::now();
    let report = orchestrator
        .run(words, |word: String, _index, reporter| {
            let pool = Arc::clone(&pool);
            let invoker = invoker.clone();
            let models = models.clone();
            async move {
                reporter.report(1, 10, "definition");
                let outcome = invoker
                    .call_with_consensus(
                        "definition",
                        &word,
                        &models,
                        |model: &ModelDescriptor| {
                            let pool = Arc::clone(&pool);
                            let text = if model.name == "m3" {
                                format!("{word}: minority")
                            } else {
                                format!("{word}: majority")
                            };
                            async move {
                                let permit = pool.acquire().await;
                                permit.release();
                                Ok::<_, String>(text)
                            }
                        },
                        as_text,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                reporter.report(1, 100, "definition done");
                Ok::<_, String>(outcome.response)
            }
        })
        .await;

    // 12 grants at 5 per minute span three windows.
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(report.summary.succeeded, 4);
    assert!(report
        .progress
        .iter()
        .all(|p| p.status == ItemStatus::Completed));
    assert_eq!(report.outcomes[0].as_deref(), Ok("apple: majority"));

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sink.records().len(), 4);
    assert_eq!(pool.snapshot().in_flight, 0);
}
