//! Session lifecycle registry
//!
//! Owns every per-video session explicitly: sessions start lazily on
//! the first subscriber, stop when the subscriber set empties, and all
//! queries and mutations route through the session's state lock so they
//! serialize with the in-progress tick.

use crate::domain::geometry::Point;
use crate::domain::types::{GateId, VideoId, ZoneId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::broadcast::{Broadcaster, SubscriberId};
use crate::io::source::SourceProvider;
use crate::services::aggregator::{CrowdMetrics, TrendMetric, TrendPoint};
use crate::services::alerts::{Alert, AlertCallback, AlertCounts, AlertManager};
use crate::services::anomaly::{AnomalyEvent, AnomalySummary};
use crate::services::dwell::{AnomalousDwell, DwellSummary, OccupancySample};
use crate::services::flow::{CounterFlowSummary, FlowGrid, FlowVector};
use crate::services::gates::{GateCrossing, GateFlowRate, GateStats};
use crate::services::session::{
    run_session_loop, SessionEvent, SessionShared, SessionState,
};
use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

struct SessionHandle {
    shared: Arc<SessionShared>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of all live analytic sessions plus the global alert manager
pub struct SessionRegistry {
    config: Config,
    provider: Arc<dyn SourceProvider>,
    metrics: Arc<Metrics>,
    alerts: Arc<Mutex<AlertManager>>,
    sessions: Mutex<FxHashMap<VideoId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(config: Config, provider: Arc<dyn SourceProvider>) -> Self {
        let alerts = Arc::new(Mutex::new(AlertManager::new(config.thresholds().clone())));
        Self {
            config,
            provider,
            metrics: Arc::new(Metrics::new()),
            alerts,
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Attach a subscriber to a video's result stream, lazily starting
    /// the session on first interest
    pub fn subscribe(
        &self,
        video_id: &VideoId,
    ) -> anyhow::Result<(SubscriberId, mpsc::Receiver<SessionEvent>)> {
        let mut sessions = self.sessions.lock();

        let needs_start = match sessions.get(video_id) {
            Some(handle) => handle.task.is_finished(),
            None => true,
        };

        if needs_start {
            // Open the upstream feed before creating any session state so
            // a failed open leaves the registry untouched
            let source = self.provider.open(video_id)?;
            let shared = Arc::new(SessionShared {
                video_id: video_id.clone(),
                state: Mutex::new(SessionState::new(video_id.clone(), &self.config)),
                broadcaster: Mutex::new(Broadcaster::new()),
            });
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let task = tokio::spawn(run_session_loop(
                shared.clone(),
                source,
                cancel_rx,
                Duration::from_millis(self.config.tick_interval_ms()),
                Duration::from_millis(self.config.read_timeout_ms()),
                self.metrics.clone(),
                self.alerts.clone(),
            ));
            sessions.insert(video_id.clone(), SessionHandle { shared, cancel_tx, task });
        }

        let Some(handle) = sessions.get(video_id) else {
            bail!("session for video '{video_id}' vanished during start");
        };
        let (id, rx) =
            handle.shared.broadcaster.lock().subscribe(self.config.subscriber_buffer());
        self.metrics.record_subscriber_attached();
        Ok((id, rx))
    }

    /// Detach a subscriber. When the last one leaves, the session is
    /// cancelled and removed.
    pub fn unsubscribe(&self, video_id: &VideoId, id: SubscriberId) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(handle) = sessions.get(video_id) else {
            return false;
        };

        let removed = handle.shared.broadcaster.lock().unsubscribe(id);
        let empty = handle.shared.broadcaster.lock().is_empty();
        if empty {
            let _ = handle.cancel_tx.send(true);
            sessions.remove(video_id);
            info!(video_id = %video_id, "session_teardown_no_subscribers");
        }
        removed
    }

    /// Videos with a live session
    pub fn active_sessions(&self) -> Vec<VideoId> {
        let sessions = self.sessions.lock();
        let mut ids: Vec<VideoId> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current subscriber count for a video (zero when no session)
    pub fn subscriber_count(&self, video_id: &VideoId) -> usize {
        let sessions = self.sessions.lock();
        sessions.get(video_id).map_or(0, |h| h.shared.broadcaster.lock().len())
    }

    /// Cancel every session (process shutdown)
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock();
        for (video_id, handle) in sessions.drain() {
            let _ = handle.cancel_tx.send(true);
            info!(video_id = %video_id, "session_shutdown");
        }
    }

    fn with_state<T>(
        &self,
        video_id: &VideoId,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> anyhow::Result<T> {
        let sessions = self.sessions.lock();
        match sessions.get(video_id) {
            Some(handle) => {
                let mut state = handle.shared.state.lock();
                Ok(f(&mut state))
            }
            None => bail!("no active session for video '{video_id}'"),
        }
    }

    // --- Gate queries ---

    pub fn gate_stats(&self, video_id: &VideoId) -> anyhow::Result<Vec<GateStats>> {
        self.with_state(video_id, |s| s.gates.gate_stats())
    }

    pub fn gate_stats_for(
        &self,
        video_id: &VideoId,
        gate_id: &GateId,
    ) -> anyhow::Result<GateStats> {
        self.with_state(video_id, |s| s.gates.gate_stats_for(gate_id))?
    }

    pub fn gate_flow_rate(
        &self,
        video_id: &VideoId,
        gate_id: &GateId,
        window_seconds: f64,
    ) -> anyhow::Result<GateFlowRate> {
        self.with_state(video_id, |s| s.gates.flow_rate(gate_id, window_seconds, s.now()))?
    }

    pub fn recent_crossings(
        &self,
        video_id: &VideoId,
        limit: usize,
    ) -> anyhow::Result<Vec<GateCrossing>> {
        self.with_state(video_id, |s| s.gates.recent_crossings(limit))
    }

    // --- Flow queries ---

    pub fn dominant_flow(&self, video_id: &VideoId) -> anyhow::Result<Option<FlowVector>> {
        self.with_state(video_id, |s| s.flow.dominant_flow())
    }

    pub fn counter_flow_summary(
        &self,
        video_id: &VideoId,
    ) -> anyhow::Result<CounterFlowSummary> {
        self.with_state(video_id, |s| s.flow.counter_flow_summary())
    }

    pub fn direction_grid(&self, video_id: &VideoId) -> anyhow::Result<FlowGrid> {
        self.with_state(video_id, |s| s.flow.direction_grid())
    }

    // --- Dwell queries ---

    pub fn dwell_summary(&self, video_id: &VideoId) -> anyhow::Result<DwellSummary> {
        self.with_state(video_id, |s| s.dwell.summary(s.now()))
    }

    pub fn dwell_anomalies(&self, video_id: &VideoId) -> anyhow::Result<Vec<AnomalousDwell>> {
        self.with_state(video_id, |s| s.dwell.anomalous_dwells(s.now()))
    }

    pub fn occupancy_history(
        &self,
        video_id: &VideoId,
        zone_id: &ZoneId,
        window_seconds: f64,
    ) -> anyhow::Result<Vec<OccupancySample>> {
        self.with_state(video_id, |s| s.dwell.occupancy_history(zone_id, window_seconds, s.now()))?
    }

    // --- Anomaly queries ---

    pub fn anomaly_summary(&self, video_id: &VideoId) -> anyhow::Result<AnomalySummary> {
        self.with_state(video_id, |s| s.anomalies.summary())
    }

    pub fn recent_anomalies(
        &self,
        video_id: &VideoId,
        max_age_seconds: f64,
    ) -> anyhow::Result<Vec<AnomalyEvent>> {
        self.with_state(video_id, |s| s.anomalies.recent_events(max_age_seconds, s.now()))
    }

    // --- Metrics queries ---

    pub fn crowd_metrics(&self, video_id: &VideoId) -> anyhow::Result<CrowdMetrics> {
        self.with_state(video_id, |s| s.aggregator.metrics(s.now()))
    }

    pub fn trend_data(
        &self,
        video_id: &VideoId,
        metric: TrendMetric,
        points: usize,
    ) -> anyhow::Result<Vec<TrendPoint>> {
        self.with_state(video_id, |s| s.aggregator.trend_data(metric, points))
    }

    // --- Mutations ---

    pub fn reset_gates(
        &self,
        video_id: &VideoId,
        gate_id: Option<&GateId>,
    ) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.gates.reset(gate_id))?
    }

    pub fn reset_zones(
        &self,
        video_id: &VideoId,
        zone_id: Option<&ZoneId>,
    ) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.dwell.reset(zone_id))?
    }

    pub fn reset_flow(&self, video_id: &VideoId) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.flow.reset())
    }

    pub fn reset_anomalies(&self, video_id: &VideoId) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.anomalies.reset())
    }

    /// Reset every analyzer of one session
    pub fn reset_session(&self, video_id: &VideoId) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.reset_all())
    }

    pub fn set_zone_area(&self, video_id: &VideoId, area_sqm: f64) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.aggregator.set_zone_area(area_sqm))?
    }

    pub fn set_service_rate(
        &self,
        video_id: &VideoId,
        rate_per_min: f64,
    ) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.aggregator.set_service_rate(rate_per_min))?
    }

    pub fn set_gate_line(
        &self,
        video_id: &VideoId,
        gate_id: &GateId,
        line: (Point, Point),
    ) -> anyhow::Result<()> {
        self.with_state(video_id, |s| s.gates.set_gate_line(gate_id, line))?
    }

    // --- Alerts (global lifecycle, independent of sessions) ---

    /// Evaluate a session's latest metrics on demand
    pub fn check_alerts(&self, video_id: &VideoId) -> anyhow::Result<Vec<Alert>> {
        let (metrics, now) =
            self.with_state(video_id, |s| (s.aggregator.metrics(s.now()), s.now()))?;
        let created = self.alerts.lock().check_metrics(&metrics, video_id.as_str(), now);
        for _ in &created {
            self.metrics.record_alert_created();
        }
        Ok(created)
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> anyhow::Result<()> {
        self.alerts.lock().acknowledge(alert_id)
    }

    pub fn resolve_alert(&self, alert_id: &str) -> anyhow::Result<()> {
        self.alerts.lock().resolve(alert_id)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().active_alerts()
    }

    pub fn alert_counts(&self) -> AlertCounts {
        self.alerts.lock().alert_counts()
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().alert_history(limit)
    }

    pub fn register_alert_callback(&self, callback: AlertCallback) {
        self.alerts.lock().register_callback(callback);
    }

    pub fn set_alert_threshold(&self, key: &str, value: f64) -> anyhow::Result<()> {
        self.alerts.lock().set_threshold(key, value)
    }

    pub fn clear_resolved_alerts(&self) {
        self.alerts.lock().clear_resolved();
    }
}
