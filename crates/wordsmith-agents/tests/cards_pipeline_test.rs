//! Integration tests for the card pipeline wired the way the binary wires it:
//! config → pool registry → model router → consensus → two batch phases.

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::time::Instant;
use wordsmith_agents::{
    parse_word_list, AgentsConfig, CardGenerator, ModelInvoker, ModelRouter, OfflineInvoker,
};
use wordsmith_coordination::{
    ConsensusInvoker, JsonlDivergenceSink, MemoryDivergenceSink, PoolRegistry, ProviderQuota,
};

fn generator_for(
    config: &AgentsConfig,
    pools: &PoolRegistry,
    offline: OfflineInvoker,
    consensus: ConsensusInvoker,
) -> CardGenerator {
    let offline = Arc::new(offline);
    let router = ModelRouter::from_config(
        config,
        pools,
        Some(offline.clone() as Arc<dyn ModelInvoker>),
    )
    .expect("router");
    let mut generator = CardGenerator::new(
        Arc::new(router),
        offline,
        consensus,
        config.models.clone(),
        config.engine.batch.clone(),
    );
    if let Some(pool) = pools.get(&config.models.image_provider) {
        generator = generator.with_image_pool(pool);
    }
    generator
}

#[tokio::test]
async fn dissenting_provider_is_logged_but_outvoted() {
    let dir = tempdir().expect("Failed to create temp dir");
    let log = dir.path().join("divergence.jsonl");
    let sink = Arc::new(JsonlDivergenceSink::new(&log));

    let config = AgentsConfig::default();
    let pools = PoolRegistry::from_quotas(&config.engine.providers).unwrap();
    let offline = OfflineInvoker::new().answering("claude-3-5-haiku-latest", "a different take");
    let generator = generator_for(&config, &pools, offline, ConsensusInvoker::new(sink.clone()));

    let words = parse_word_list("lucid\nbrisk\nserene\n").unwrap();
    let run = generator.run(words).await.unwrap();

    assert_eq!(run.summary.succeeded, 3);
    assert_eq!(run.images.len(), 3);
    for card in &run.cards {
        assert!(card.definition.starts_with("offline: Define"));
        assert_eq!(card.definition_model, "gpt-4o-mini");
    }

    // definition and example disagree for every word; image prompts agree.
    let mut records = Vec::new();
    for _ in 0..100 {
        records = sink.read_all().unwrap();
        if records.len() >= 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(records.len(), 6);
    assert!(records
        .iter()
        .all(|r| r.operation_type == "definition" || r.operation_type == "example"));
}

#[tokio::test(start_paused = true)]
async fn provider_quota_paces_the_run() {
    let mut config = AgentsConfig::default();
    config.engine.providers = vec![
        ProviderQuota::new("openai", 4, 2),
        ProviderQuota::new("anthropic", 50, 4),
        ProviderQuota::new("google", 15, 0),
    ];
    let pools = PoolRegistry::from_quotas(&config.engine.providers).unwrap();
    let sink = Arc::new(MemoryDivergenceSink::new());
    let generator = generator_for(
        &config,
        &pools,
        OfflineInvoker::new(),
        ConsensusInvoker::new(sink.clone()),
    );

    let words = parse_word_list("lucid\nbrisk\n").unwrap();
    let started = Instant::now();
    let run = generator.run(words).await.unwrap();

    // Each word makes three openai text calls plus one openai image call:
    // eight grants at four per minute need a second window.
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(run.cards.len(), 2);
    assert_eq!(run.images.len(), 2);
    assert!(sink.records().is_empty());

    let openai = pools.get("openai").unwrap().snapshot();
    assert_eq!(openai.in_flight, 0);
}

#[tokio::test]
async fn failing_majority_stage_fails_only_that_word() {
    let mut config = AgentsConfig::default();
    config.models.definition.truncate(1);
    let pools = PoolRegistry::new();
    let offline = OfflineInvoker::new().failing("gpt-4o-mini");
    let generator = generator_for(&config, &pools, offline, ConsensusInvoker::default());

    let words = parse_word_list("lucid\nbrisk\n").unwrap();
    let run = generator.run(words).await.unwrap();

    assert_eq!(run.summary.failed, 2);
    assert!(run.cards.is_empty());
    assert!(run.images.is_empty());
    assert_eq!(
        run.summary.errors,
        vec!["all models failed for definition", "all models failed for definition"]
    );
    assert_eq!(run.failures[0].word_id, "lucid");
}
