//! Per-video analytic sessions
//!
//! A session owns one instance of every analyzer and drives them in a
//! fixed order over each snapshot, merging their outputs into a single
//! tick result that is fanned out to subscribers. The session loop is a
//! single task per video: read snapshot (bounded timeout), advance
//! analyzers, publish, pace; cancellation is observed at tick
//! boundaries so no analyzer update is ever left half-applied.

mod registry;
#[cfg(test)]
mod tests;

pub use registry::SessionRegistry;

use crate::domain::types::{Snapshot, VideoId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::broadcast::Broadcaster;
use crate::io::source::SnapshotSource;
use crate::services::aggregator::{CrowdMetrics, MetricsAggregator};
use crate::services::alerts::AlertManager;
use crate::services::anomaly::{AnomalyDetector, AnomalyEvent, AnomalyTickResult};
use crate::services::dwell::{DwellSummary, DwellTracker};
use crate::services::flow::{CounterFlowEvent, CounterFlowSummary, FlowAnalyzer, FlowVector};
use crate::services::gates::{GateCounter, GateCrossing, GateStats};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Gate throughput window feeding the metrics aggregator
const THROUGHPUT_WINDOW_SECS: f64 = 60.0;

/// Merged output of one tick across all analyzers
#[derive(Debug, Clone, Serialize)]
pub struct TickOutput {
    pub video_id: VideoId,
    pub tick: u64,
    pub timestamp: f64,
    pub people_count: usize,
    pub gate_stats: Vec<GateStats>,
    pub new_crossings: Vec<GateCrossing>,
    pub dominant_flow: Option<FlowVector>,
    pub new_counter_flow: Vec<CounterFlowEvent>,
    pub counter_flow: CounterFlowSummary,
    pub dwell: DwellSummary,
    pub new_anomalies: Vec<AnomalyEvent>,
    pub metrics: CrowdMetrics,
}

/// What subscribers receive from a session's stream
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Tick(Arc<TickOutput>),
    /// Terminal: delivered once, after which the stream ends
    Error { message: String },
}

/// All analyzer state for one video feed
pub struct SessionState {
    video_id: VideoId,
    pub gates: GateCounter,
    pub flow: FlowAnalyzer,
    pub dwell: DwellTracker,
    pub anomalies: AnomalyDetector,
    pub aggregator: MetricsAggregator,
    tick: u64,
    last_time: f64,
}

impl SessionState {
    pub fn new(video_id: VideoId, config: &Config) -> Self {
        Self {
            video_id,
            gates: GateCounter::new(config.gates()),
            flow: FlowAnalyzer::new(config.counter_flow_angle()),
            dwell: DwellTracker::new(config.zones()),
            anomalies: AnomalyDetector::new(),
            aggregator: MetricsAggregator::new(
                config.zone_area_sqm(),
                config.service_rate_per_min(),
            ),
            tick: 0,
            last_time: 0.0,
        }
    }

    /// Time of the most recent processed snapshot; queries use this so
    /// windowed lookups line up with analyzer timestamps
    pub fn now(&self) -> f64 {
        self.last_time
    }

    /// Drive one snapshot through every analyzer in fixed order and
    /// merge the outputs.
    ///
    /// A fault inside one analyzer is contained: the others still run
    /// and the tick completes with that analyzer's output defaulted.
    pub fn advance(&mut self, snapshot: &Snapshot) -> TickOutput {
        let now = snapshot.time();
        self.tick += 1;
        self.last_time = now;

        let new_crossings = guarded(&self.video_id, "gates", || self.gates.update(snapshot, now))
            .unwrap_or_default();

        let flow_result = guarded(&self.video_id, "flow", || self.flow.update(snapshot, now));

        guarded(&self.video_id, "dwell", || self.dwell.update(snapshot, now));

        let anomaly_result =
            guarded(&self.video_id, "anomaly", || self.anomalies.update(snapshot, now));

        let flow_rate = self.gates.entry_throughput(THROUGHPUT_WINDOW_SECS, now);
        self.aggregator.update(
            snapshot.persons.len(),
            snapshot.crowd_velocity,
            flow_rate,
            now,
        );

        let (dominant_flow, new_counter_flow) = match flow_result {
            Some(result) => (result.dominant_flow, result.counter_flow_events),
            None => (self.flow.dominant_flow(), Vec::new()),
        };
        let new_anomalies = match anomaly_result {
            Some(AnomalyTickResult { new_events, .. }) => new_events,
            None => Vec::new(),
        };

        TickOutput {
            video_id: self.video_id.clone(),
            tick: self.tick,
            timestamp: now,
            people_count: snapshot.persons.len(),
            gate_stats: self.gates.gate_stats(),
            new_crossings,
            dominant_flow,
            new_counter_flow,
            counter_flow: self.flow.counter_flow_summary(),
            dwell: self.dwell.summary(now),
            new_anomalies,
            metrics: self.aggregator.metrics(now),
        }
    }

    /// Discard all analyzer state, as if the session had just started
    pub fn reset_all(&mut self) {
        // Scoped resets with None never fail
        let _ = self.gates.reset(None);
        let _ = self.dwell.reset(None);
        self.flow.reset();
        self.anomalies.reset();
        self.aggregator.reset();
    }
}

/// Run a single analyzer step, containing panics so one faulty analyzer
/// cannot take down the tick or the session
fn guarded<T>(video_id: &VideoId, analyzer: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(video_id = %video_id, analyzer = %analyzer, "analyzer_fault_isolated");
            None
        }
    }
}

/// State shared between a session's loop task and registry queries.
/// Query access locks the state mutex and therefore serializes with the
/// in-progress tick.
pub(crate) struct SessionShared {
    pub(crate) video_id: VideoId,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) broadcaster: Mutex<Broadcaster<SessionEvent>>,
}

/// The per-session processing loop.
///
/// Suspension points are the pacing interval and the bounded snapshot
/// read; neither holds the state lock. Upstream failure or exhaustion is
/// reported once as a terminal event, then the loop exits.
pub(crate) async fn run_session_loop(
    shared: Arc<SessionShared>,
    mut source: Box<dyn SnapshotSource>,
    mut cancel_rx: watch::Receiver<bool>,
    tick_interval: Duration,
    read_timeout: Duration,
    metrics: Arc<Metrics>,
    alerts: Arc<Mutex<AlertManager>>,
) {
    let video_id = shared.video_id.clone();
    info!(video_id = %video_id, "session_started");
    metrics.record_session_started();

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let terminal: Option<String> = loop {
        // Pacing delay, interruptible by cancellation
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break None;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        if *cancel_rx.borrow() {
            break None;
        }

        // Bounded read from the upstream source
        let read = tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break None;
                }
                continue;
            }
            read = tokio::time::timeout(read_timeout, source.next_snapshot()) => read,
        };

        let snapshot = match read {
            Err(_) => {
                metrics.record_source_error();
                break Some(format!(
                    "snapshot read timed out after {}ms",
                    read_timeout.as_millis()
                ));
            }
            Ok(Err(e)) => {
                metrics.record_source_error();
                break Some(format!("upstream source failed: {e:#}"));
            }
            Ok(Ok(None)) => {
                break Some("upstream source exhausted".to_string());
            }
            Ok(Ok(Some(snapshot))) => snapshot,
        };

        let started = Instant::now();
        let output = {
            let mut state = shared.state.lock();
            state.advance(&snapshot)
        };
        metrics.record_tick(started.elapsed().as_micros() as u64);
        metrics.record_crossings(output.new_crossings.len() as u64);
        metrics.record_anomalies(output.new_anomalies.len() as u64);

        // Alert evaluation rides on the merged metrics, zone = video id
        let created = {
            let mut alerts = alerts.lock();
            alerts.check_metrics(&output.metrics, video_id.as_str(), output.timestamp)
        };
        for _ in &created {
            metrics.record_alert_created();
        }

        let dropped = shared.broadcaster.lock().broadcast(SessionEvent::Tick(Arc::new(output)));
        for _ in 0..dropped {
            metrics.record_subscriber_dropped();
        }
    };

    if let Some(message) = terminal {
        warn!(video_id = %video_id, error = %message, "session_terminal_error");
        let mut broadcaster = shared.broadcaster.lock();
        broadcaster.broadcast(SessionEvent::Error { message });
        // Close all subscriber channels so consumers see end-of-stream
        broadcaster.clear();
    }

    metrics.record_session_stopped();
    info!(video_id = %video_id, "session_stopped");
}
