//! File-backed store: what goes in comes back out.

use std::time::Duration;

use strata_core::{
    config::EngineConfig,
    event::{EventLogEntry, PipelineEvent},
    factor_aggregator::aggregate_factors,
    layer_scorer::LayerRecord,
    monte_carlo::MonteCarloSimulator,
    pattern_matcher::{MetricSnapshot, PatternCatalog, PatternMatcher},
    persistence::{ResultStore, TopicResults},
    provenance::{Provenance, Stage},
    segment_aggregator::aggregate_segments,
    store::AnalysisStore,
};

fn temp_store() -> (tempfile::TempDir, AnalysisStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strata.db");
    let store = AnalysisStore::open_migrated(path.to_str().unwrap()).unwrap();
    (dir, store)
}

/// A full set of results for one topic, computed without a generator.
fn results(topic_id: &str) -> TopicResults {
    let config = EngineConfig::default_test();
    let layers: Vec<LayerRecord> = config
        .hierarchy
        .layers()
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            LayerRecord::neutral(
                topic_id,
                &slot.layer.id,
                slot.factor_id,
                &slot.layer.persona,
                slot.layer.weight,
                Provenance::new(Stage::LayerScoring, "scripted:default").with_run_token(Some("run-1")),
            )
            .with_assessment(0.1 + 0.05 * i as f64, 0.7, vec![format!("insight {i}")])
        })
        .collect();
    let factors = aggregate_factors(topic_id, &config.hierarchy, &layers, Some("run-1"));
    let (segments, overall) = aggregate_segments(topic_id, &config.hierarchy, &factors, Some("run-1"));

    let simulator = MonteCarloSimulator::new(&config.simulation).with_seed(Some(9));
    let catalog = PatternCatalog::build(config.patterns.clone(), &config.hierarchy, &simulator).unwrap();
    let snapshot = MetricSnapshot::from_records(&factors, &segments, Some(&overall));
    let pattern_matches = PatternMatcher::new(&config.matching).evaluate_all(topic_id, &catalog, &snapshot, Some("run-1"));
    let simulations = catalog
        .patterns()
        .iter()
        .flat_map(|p| simulator.simulate_pattern(topic_id, p, Some("run-1")).into_values())
        .map(|r| r.unwrap())
        .collect();

    TopicResults {
        topic_id: topic_id.to_string(),
        layers,
        factors,
        segments,
        overall: Some(overall),
        pattern_matches,
        simulations,
    }
}

#[tokio::test]
async fn persisted_results_read_back_identically() {
    let (_dir, store) = temp_store();
    let written = results("t1");

    store.persist_results(&written).await.unwrap();
    let read = store.fetch_latest("t1").await.unwrap();

    assert_eq!(read.layers.len(), 14);
    assert_eq!(read.simulations.len(), 3);
    assert_eq!(read, written);
}

#[tokio::test]
async fn results_survive_reopen() {
    let (_dir, store) = temp_store();
    store.persist_results(&results("t1")).await.unwrap();

    let reopened = store.reopen().unwrap();
    let read = reopened.fetch_latest("t1").await.unwrap();
    assert_eq!(read.factors.len(), 7);
    assert!(read.overall.is_some());
    assert_eq!(reopened.list_topics().unwrap(), vec!["t1".to_string()]);
}

#[tokio::test]
async fn rewriting_a_topic_replaces_rather_than_duplicates() {
    let (_dir, store) = temp_store();
    store.persist_results(&results("t1")).await.unwrap();

    let mut second = results("t1");
    second.layers[0] = second.layers[0].clone().degraded("timeout");
    second.pattern_matches.truncate(1);
    second.simulations.truncate(1);
    store.persist_results(&second).await.unwrap();

    let read = store.fetch_latest("t1").await.unwrap();
    assert_eq!(read.layers.len(), 14);
    assert_eq!(read.layers[0].degraded_reason.as_deref(), Some("timeout"));
    assert_eq!(read.pattern_matches.len(), 1);
    assert_eq!(read.simulations.len(), 1, "stale simulations cleared");
}

#[tokio::test]
async fn topics_are_isolated() {
    let (_dir, store) = temp_store();
    store.persist_results(&results("t1")).await.unwrap();
    store.persist_results(&results("t2")).await.unwrap();

    store.delete_topic("t1").unwrap();
    assert!(store.fetch_latest("t1").await.unwrap().is_empty());
    assert_eq!(store.fetch_latest("t2").await.unwrap().layers.len(), 14);
    assert!(!store.topic_exists("t1").unwrap());
}

#[tokio::test]
async fn topic_lock_is_exclusive_until_released() {
    let (_dir, store) = temp_store();
    let lease = Duration::from_secs(600);

    assert!(store.acquire_topic_lock("t1", "run-a", lease).await.unwrap());
    assert!(!store.acquire_topic_lock("t1", "run-b", lease).await.unwrap());
    assert!(store.acquire_topic_lock("t1", "run-a", lease).await.unwrap(), "holder may re-acquire");

    store.release_topic_lock("t1", "run-b").await.unwrap();
    assert_eq!(store.topic_lock_holder("t1").unwrap().as_deref(), Some("run-a"));

    store.release_topic_lock("t1", "run-a").await.unwrap();
    assert!(store.acquire_topic_lock("t1", "run-b", lease).await.unwrap());
}

#[tokio::test]
async fn expired_lock_survives_reopen_and_is_taken_over() {
    let (_dir, store) = temp_store();
    let lease = Duration::from_millis(1);
    assert!(store.acquire_topic_lock("t1", "crashed", lease).await.unwrap());

    let reopened = store.reopen().unwrap();
    assert_eq!(reopened.topic_lock_holder("t1").unwrap().as_deref(), Some("crashed"));
    std::thread::sleep(Duration::from_millis(10));
    assert!(reopened.acquire_topic_lock("t1", "next", lease).await.unwrap());
    assert_eq!(reopened.topic_lock_holder("t1").unwrap().as_deref(), Some("next"));
}

#[tokio::test]
async fn event_log_preserves_order_and_payload() {
    let (_dir, store) = temp_store();
    let events = [
        PipelineEvent::StateEntered { state: "SCORING_LAYERS".into() },
        PipelineEvent::LayerDegraded { layer_id: "L3".into(), reason: "timeout".into() },
        PipelineEvent::StateEntered { state: "AGGREGATING_FACTORS".into() },
    ];
    for event in &events {
        let entry = EventLogEntry::new("t1", "run-1", event).unwrap();
        ResultStore::append_event(&store, &entry).await.unwrap();
    }

    let read = store.events_for_topic("t1").unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[1].event_type, "layer_degraded");
    assert_eq!(read[1].event().unwrap(), events[1]);
    assert!(read.iter().all(|e| e.id.is_some() && e.run_token == "run-1"));
}
