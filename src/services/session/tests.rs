//! Tests for the session engine and registry

use super::*;
use crate::domain::geometry::Point;
use crate::domain::types::{GateId, TrackId, TrackedPerson};
use crate::io::source::{ScriptedSource, SourceProvider};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Provider that hands each video a scripted snapshot sequence
struct TestProvider {
    scripts: Mutex<FxHashMap<VideoId, Vec<Snapshot>>>,
}

impl TestProvider {
    fn new() -> Self {
        Self { scripts: Mutex::new(FxHashMap::default()) }
    }

    fn with_script(self, video_id: &str, frames: Vec<Snapshot>) -> Self {
        self.scripts.lock().insert(VideoId::from(video_id), frames);
        self
    }
}

impl SourceProvider for TestProvider {
    fn open(&self, video_id: &VideoId) -> anyhow::Result<Box<dyn SnapshotSource>> {
        match self.scripts.lock().get(video_id) {
            Some(frames) => Ok(Box::new(ScriptedSource::new(frames.clone()))),
            None => bail!("no such video '{video_id}'"),
        }
    }
}

fn person(id: &str, x: f64, y: f64) -> TrackedPerson {
    TrackedPerson {
        id: TrackId::from(id),
        x,
        y,
        width: 12.0,
        height: 24.0,
        confidence: 0.9,
        timestamp: 0.0,
    }
}

fn frame(persons: Vec<TrackedPerson>, timestamp: f64) -> Snapshot {
    Snapshot { persons, crowd_velocity: 1.0, timestamp }
}

fn test_config() -> Config {
    Config::default().with_session_tuning(5, 1000, 16)
}

fn registry_with(provider: TestProvider, config: Config) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(config, Arc::new(provider)))
}

async fn wait_for_idle(registry: &SessionRegistry) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while registry.metrics().sessions_active() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session loop did not stop");
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_receives_ticks_then_terminal() {
    let frames = vec![
        frame(vec![person("T001", 0.5, 0.3)], 100.0),
        frame(vec![person("T001", 0.5, 0.32)], 100.2),
        frame(vec![person("T001", 0.5, 0.34)], 100.4),
    ];
    let provider = TestProvider::new().with_script("cam1", frames);
    let registry = registry_with(provider, test_config());

    let video = VideoId::from("cam1");
    let (_id, mut rx) = registry.subscribe(&video).unwrap();

    for expected_tick in 1..=3u64 {
        match rx.recv().await.expect("stream ended early") {
            SessionEvent::Tick(output) => {
                assert_eq!(output.tick, expected_tick);
                assert_eq!(output.video_id, video);
                assert_eq!(output.people_count, 1);
                assert_eq!(output.gate_stats.len(), 2);
                assert!(output.metrics.density > 0.0);
            }
            SessionEvent::Error { message } => panic!("unexpected error: {message}"),
        }
    }

    // Source exhausted: exactly one terminal error, then end-of-stream
    match rx.recv().await.expect("expected terminal event") {
        SessionEvent::Error { message } => assert!(message.contains("exhausted")),
        SessionEvent::Tick(_) => panic!("expected terminal error"),
    }
    assert!(rx.recv().await.is_none());

    wait_for_idle(&registry).await;
}

#[tokio::test(start_paused = true)]
async fn test_gate_crossing_flows_into_output() {
    // Default main_entrance gate sits at y = 0.6
    let frames = vec![
        frame(vec![person("T001", 0.5, 0.55)], 100.0),
        frame(vec![person("T001", 0.5, 0.65)], 100.2),
    ];
    let provider = TestProvider::new().with_script("gatecam", frames);
    let registry = registry_with(provider, test_config());

    let video = VideoId::from("gatecam");
    let (_id, mut rx) = registry.subscribe(&video).unwrap();

    let first = match rx.recv().await.unwrap() {
        SessionEvent::Tick(output) => output,
        SessionEvent::Error { message } => panic!("{message}"),
    };
    assert!(first.new_crossings.is_empty());

    let second = match rx.recv().await.unwrap() {
        SessionEvent::Tick(output) => output,
        SessionEvent::Error { message } => panic!("{message}"),
    };
    assert_eq!(second.new_crossings.len(), 1);
    assert_eq!(second.new_crossings[0].gate_id.as_str(), "main_entrance");

    let main_gate =
        second.gate_stats.iter().find(|g| g.gate_id.as_str() == "main_entrance").unwrap();
    assert_eq!(main_gate.entry_count, 1);

    // The registry query sees the same state, serialized with the loop
    let stats = registry.gate_stats_for(&video, &GateId::from("main_entrance")).unwrap();
    assert_eq!(stats.entry_count, 1);
    assert!(registry.gate_stats_for(&video, &GateId::from("nope")).is_err());
    assert_eq!(registry.gate_stats(&video).unwrap().len(), 2);

    wait_for_idle(&registry).await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_last_consumer_stops_session() {
    let frames: Vec<Snapshot> = (0..1000)
        .map(|i| frame(vec![person("T001", 0.5, 0.3)], 100.0 + i as f64 * 0.2))
        .collect();
    let provider = TestProvider::new().with_script("cam1", frames);
    let registry = registry_with(provider, test_config());

    let video = VideoId::from("cam1");
    let (id, mut rx) = registry.subscribe(&video).unwrap();
    assert_eq!(registry.active_sessions(), vec![video.clone()]);
    assert_eq!(registry.subscriber_count(&video), 1);

    // Consume one tick to prove the loop is alive
    assert!(matches!(rx.recv().await, Some(SessionEvent::Tick(_))));

    assert!(registry.unsubscribe(&video, id));
    assert!(registry.active_sessions().is_empty());
    assert_eq!(registry.subscriber_count(&video), 0);

    // The loop observes the cancellation at a tick boundary and exits
    wait_for_idle(&registry).await;

    // Unsubscribing again is a no-op
    assert!(!registry.unsubscribe(&video, id));
}

#[tokio::test(start_paused = true)]
async fn test_two_subscribers_share_one_session() {
    let frames: Vec<Snapshot> = (0..100)
        .map(|i| frame(vec![person("T001", 0.5, 0.3)], 100.0 + i as f64 * 0.2))
        .collect();
    let provider = TestProvider::new().with_script("cam1", frames);
    let registry = registry_with(provider, test_config());

    let video = VideoId::from("cam1");
    let (id_a, mut rx_a) = registry.subscribe(&video).unwrap();
    let (id_b, mut rx_b) = registry.subscribe(&video).unwrap();

    assert_eq!(registry.active_sessions().len(), 1);
    assert_eq!(registry.subscriber_count(&video), 2);

    assert!(matches!(rx_a.recv().await, Some(SessionEvent::Tick(_))));
    assert!(matches!(rx_b.recv().await, Some(SessionEvent::Tick(_))));

    // One leaving keeps the session alive for the other
    assert!(registry.unsubscribe(&video, id_a));
    assert_eq!(registry.active_sessions().len(), 1);
    assert!(matches!(rx_b.recv().await, Some(SessionEvent::Tick(_))));

    assert!(registry.unsubscribe(&video, id_b));
    assert!(registry.active_sessions().is_empty());
    wait_for_idle(&registry).await;
}

#[tokio::test(start_paused = true)]
async fn test_queries_require_active_session() {
    let registry = registry_with(TestProvider::new(), test_config());
    let video = VideoId::from("ghost");

    let err = registry.gate_stats(&video).unwrap_err();
    assert!(err.to_string().contains("no active session"));
    assert!(registry.crowd_metrics(&video).is_err());
    assert!(registry.reset_session(&video).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_unknown_video_fails_cleanly() {
    let registry = registry_with(TestProvider::new(), test_config());
    let err = registry.subscribe(&VideoId::from("missing")).unwrap_err();
    assert!(err.to_string().contains("missing"));
    assert!(registry.active_sessions().is_empty());
    assert_eq!(registry.metrics().sessions_active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_density_alert_raised_from_session_metrics() {
    // 40 people over 10 m² = 4.0 people/m², past the 3.5 critical bar
    let crowd: Vec<TrackedPerson> =
        (0..40).map(|i| person(&format!("T{i:03}"), 0.3 + (i % 8) as f64 * 0.05, 0.3)).collect();
    let frames = vec![frame(crowd.clone(), 100.0), frame(crowd, 100.2)];
    let provider = TestProvider::new().with_script("dense", frames);
    let config = test_config().with_zone_area_sqm(10.0);
    let registry = registry_with(provider, config);

    let video = VideoId::from("dense");
    let (_id, mut rx) = registry.subscribe(&video).unwrap();

    // Drain the stream so both ticks have been evaluated
    while let Some(event) = rx.recv().await {
        if matches!(event, SessionEvent::Error { .. }) {
            break;
        }
    }

    let active = registry.active_alerts();
    assert_eq!(active.len(), 1, "expected exactly one alert, got {active:?}");
    assert_eq!(active[0].zone, "dense");
    let counts = registry.alert_counts();
    assert_eq!(counts.critical, 1);

    // Acknowledge and resolve through the registry
    let alert_id = active[0].id.clone();
    registry.acknowledge_alert(&alert_id).unwrap();
    registry.resolve_alert(&alert_id).unwrap();
    assert!(registry.active_alerts().is_empty());

    wait_for_idle(&registry).await;
}

#[tokio::test(start_paused = true)]
async fn test_config_mutations_through_registry() {
    let frames: Vec<Snapshot> = (0..50)
        .map(|i| frame(vec![person("T001", 0.5, 0.3)], 100.0 + i as f64 * 0.2))
        .collect();
    let provider = TestProvider::new().with_script("cam1", frames);
    let registry = registry_with(provider, test_config());

    let video = VideoId::from("cam1");
    let (id, mut rx) = registry.subscribe(&video).unwrap();
    assert!(matches!(rx.recv().await, Some(SessionEvent::Tick(_))));

    registry.set_zone_area(&video, 50.0).unwrap();
    registry.set_service_rate(&video, 4.0).unwrap();
    assert!(registry.set_zone_area(&video, -5.0).is_err());

    let gate = GateId::from("main_entrance");
    registry
        .set_gate_line(&video, &gate, (Point::new(0.1, 0.3), Point::new(0.9, 0.3)))
        .unwrap();
    assert!(registry.set_gate_line(&video, &GateId::from("nope"), (Point::new(0.0, 0.0), Point::new(1.0, 1.0))).is_err());

    registry.reset_gates(&video, Some(&gate)).unwrap();
    assert!(registry.reset_gates(&video, Some(&GateId::from("nope"))).is_err());
    registry.reset_session(&video).unwrap();

    let stats = registry.gate_stats(&video).unwrap();
    assert!(stats.iter().all(|g| g.total_crossings == 0));

    registry.unsubscribe(&video, id);
    wait_for_idle(&registry).await;
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_after_terminal_restarts_session() {
    let frames = vec![frame(vec![person("T001", 0.5, 0.3)], 100.0)];
    let provider = TestProvider::new().with_script("cam1", frames);
    let registry = registry_with(provider, test_config());

    let video = VideoId::from("cam1");
    let (_id, mut rx) = registry.subscribe(&video).unwrap();

    // Run to exhaustion
    while rx.recv().await.is_some() {}
    wait_for_idle(&registry).await;

    // A new subscriber restarts the session from a fresh source
    let (_id2, mut rx2) = registry.subscribe(&video).unwrap();
    match rx2.recv().await.unwrap() {
        SessionEvent::Tick(output) => assert_eq!(output.tick, 1),
        SessionEvent::Error { message } => panic!("{message}"),
    }

    while rx2.recv().await.is_some() {}
    wait_for_idle(&registry).await;
}
