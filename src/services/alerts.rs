//! Threshold-driven alert lifecycle management
//!
//! Evaluates each metrics snapshot against fixed thresholds and keeps
//! alert state across ticks: at most one active unresolved alert per
//! (type, zone), a per-type-and-zone cooldown against re-firing, a
//! duration gate on congestion, and auto-resolution once the underlying
//! signal clears. Notification callbacks run best-effort per alert.

use crate::domain::types::{AlertLevel, AlertType, CongestionStatus};
use crate::infra::config::AlertThresholds;
use crate::services::aggregator::CrowdMetrics;
use anyhow::bail;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use tracing::{info, warn};
use uuid::Uuid;

/// Retained alert history
const HISTORY_CAP: usize = 1000;

/// A single alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: f64,
    pub zone: String,
    pub acknowledged: bool,
    pub resolved: bool,
    pub data: serde_json::Value,
}

/// Active alert counts by level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounts {
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
}

/// Callback invoked for every newly created alert. Failures are logged
/// and isolated per callback.
pub type AlertCallback = Box<dyn Fn(&Alert) -> anyhow::Result<()> + Send + Sync>;

/// Stateful alert manager, one per deployment
pub struct AlertManager {
    thresholds: AlertThresholds,
    /// All alerts not yet cleared, by id (resolved ones linger until
    /// clear_resolved)
    active: FxHashMap<String, Alert>,
    history: VecDeque<Alert>,
    /// Start time of an ongoing congestion condition, keyed by zone
    condition_start: FxHashMap<String, f64>,
    /// Last creation time keyed by "type_zone" for cooldown checks
    last_alert_times: FxHashMap<String, f64>,
    callbacks: Vec<AlertCallback>,
}

impl AlertManager {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            active: FxHashMap::default(),
            history: VecDeque::new(),
            condition_start: FxHashMap::default(),
            last_alert_times: FxHashMap::default(),
            callbacks: Vec::new(),
        }
    }

    /// Evaluate a metrics snapshot for one zone. Returns alerts newly
    /// created this evaluation.
    pub fn check_metrics(&mut self, metrics: &CrowdMetrics, zone: &str, now: f64) -> Vec<Alert> {
        let mut new_alerts = Vec::new();

        // Density ladder
        if metrics.density >= self.thresholds.density_critical {
            self.create_if_absent(
                AlertType::CriticalDensity,
                AlertLevel::Critical,
                format!("Critical crowd density: {:.1} people/m² in {zone}", metrics.density),
                zone,
                json!({ "density": metrics.density }),
                now,
                &mut new_alerts,
            );
        } else if metrics.density >= self.thresholds.density_warning {
            self.create_if_absent(
                AlertType::HighDensity,
                AlertLevel::Warning,
                format!("High crowd density: {:.1} people/m² in {zone}", metrics.density),
                zone,
                json!({ "density": metrics.density }),
                now,
                &mut new_alerts,
            );
        } else {
            self.resolve_types(&[AlertType::HighDensity, AlertType::CriticalDensity], zone);
        }

        // Velocity ladder
        if metrics.velocity <= self.thresholds.velocity_critical {
            self.create_if_absent(
                AlertType::LowVelocity,
                AlertLevel::Critical,
                format!("Very slow crowd movement: {:.2} m/s in {zone}", metrics.velocity),
                zone,
                json!({ "velocity": metrics.velocity }),
                now,
                &mut new_alerts,
            );
        } else if metrics.velocity <= self.thresholds.velocity_warning {
            self.create_if_absent(
                AlertType::LowVelocity,
                AlertLevel::Warning,
                format!("Slow crowd movement: {:.2} m/s in {zone}", metrics.velocity),
                zone,
                json!({ "velocity": metrics.velocity }),
                now,
                &mut new_alerts,
            );
        } else {
            self.resolve_types(&[AlertType::LowVelocity], zone);
        }

        // Congestion must persist past the duration gate before alerting
        if metrics.congestion_status.is_congested() {
            let started = *self.condition_start.entry(zone.to_string()).or_insert(now);
            let duration = now - started;
            if duration > self.thresholds.congestion_duration_secs {
                let level = if metrics.congestion_status == CongestionStatus::Severe {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                };
                self.create_if_absent(
                    AlertType::Congestion,
                    level,
                    format!("Sustained congestion detected in {zone}"),
                    zone,
                    json!({
                        "status": metrics.congestion_status.as_str(),
                        "duration": duration,
                    }),
                    now,
                    &mut new_alerts,
                );
            }
        } else {
            self.condition_start.remove(zone);
            self.resolve_types(&[AlertType::Congestion], zone);
        }

        // Queue wait ladder
        if metrics.wait_time_minutes >= self.thresholds.queue_very_long_minutes {
            self.create_if_absent(
                AlertType::LongQueue,
                AlertLevel::Critical,
                format!(
                    "Very long queue wait time: {:.0} minutes in {zone}",
                    metrics.wait_time_minutes
                ),
                zone,
                json!({ "wait_time": metrics.wait_time_minutes }),
                now,
                &mut new_alerts,
            );
        } else if metrics.wait_time_minutes >= self.thresholds.queue_long_minutes {
            self.create_if_absent(
                AlertType::LongQueue,
                AlertLevel::Warning,
                format!(
                    "Long queue wait time: {:.0} minutes in {zone}",
                    metrics.wait_time_minutes
                ),
                zone,
                json!({ "wait_time": metrics.wait_time_minutes }),
                now,
                &mut new_alerts,
            );
        } else {
            self.resolve_types(&[AlertType::LongQueue], zone);
        }

        // Best-effort notification, one failure never blocks the rest
        for alert in &new_alerts {
            for callback in &self.callbacks {
                if let Err(e) = callback(alert) {
                    warn!(alert_id = %alert.id, error = %e, "alert_callback_failed");
                }
            }
        }

        new_alerts
    }

    /// Create an alert unless one is already active for this (type, zone)
    /// or the pair is still inside its cooldown window
    #[allow(clippy::too_many_arguments)]
    fn create_if_absent(
        &mut self,
        alert_type: AlertType,
        level: AlertLevel,
        message: String,
        zone: &str,
        data: serde_json::Value,
        now: f64,
        new_alerts: &mut Vec<Alert>,
    ) {
        let already_active = self
            .active
            .values()
            .any(|a| a.alert_type == alert_type && a.zone == zone && !a.resolved);
        if already_active {
            return;
        }

        let cooldown_key = format!("{}_{zone}", alert_type.as_str());
        if let Some(&last) = self.last_alert_times.get(&cooldown_key) {
            if now - last < self.thresholds.cooldown_secs {
                return;
            }
        }

        let alert = Alert {
            id: Uuid::now_v7().to_string(),
            alert_type,
            level,
            message,
            timestamp: now,
            zone: zone.to_string(),
            acknowledged: false,
            resolved: false,
            data,
        };

        info!(
            alert_id = %alert.id,
            alert_type = alert_type.as_str(),
            level = level.as_str(),
            zone = %zone,
            "alert_created"
        );

        self.active.insert(alert.id.clone(), alert.clone());
        self.history.push_back(alert.clone());
        if self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
        self.last_alert_times.insert(cooldown_key, now);
        new_alerts.push(alert);
    }

    /// Auto-resolve active alerts of the given types in a zone
    fn resolve_types(&mut self, types: &[AlertType], zone: &str) {
        let mut resolved_ids = Vec::new();
        for alert in self.active.values_mut() {
            if types.contains(&alert.alert_type) && alert.zone == zone && !alert.resolved {
                alert.resolved = true;
                resolved_ids.push(alert.id.clone());
            }
        }
        for id in resolved_ids {
            info!(alert_id = %id, zone = %zone, "alert_auto_resolved");
            self.sync_history(&id);
        }
    }

    /// Mirror an active alert's flags into its history entry
    fn sync_history(&mut self, id: &str) {
        if let Some(alert) = self.active.get(id) {
            if let Some(entry) = self.history.iter_mut().find(|a| a.id == id) {
                entry.acknowledged = alert.acknowledged;
                entry.resolved = alert.resolved;
            }
        }
    }

    /// Acknowledge an alert by id
    pub fn acknowledge(&mut self, alert_id: &str) -> anyhow::Result<()> {
        match self.active.get_mut(alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                self.sync_history(alert_id);
                Ok(())
            }
            None => bail!("unknown alert '{alert_id}'"),
        }
    }

    /// Resolve an alert by id
    pub fn resolve(&mut self, alert_id: &str) -> anyhow::Result<()> {
        match self.active.get_mut(alert_id) {
            Some(alert) => {
                alert.resolved = true;
                self.sync_history(alert_id);
                Ok(())
            }
            None => bail!("unknown alert '{alert_id}'"),
        }
    }

    /// All unresolved alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> =
            self.active.values().filter(|a| !a.resolved).cloned().collect();
        alerts.sort_by(|a, b| {
            a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal)
        });
        alerts
    }

    /// Unresolved alert counts by level
    pub fn alert_counts(&self) -> AlertCounts {
        let mut counts = AlertCounts::default();
        for alert in self.active.values().filter(|a| !a.resolved) {
            match alert.level {
                AlertLevel::Info => counts.info += 1,
                AlertLevel::Warning => counts.warning += 1,
                AlertLevel::Critical => counts.critical += 1,
            }
        }
        counts
    }

    /// Most recent alert history, oldest first
    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Register a notification callback for new alerts
    pub fn register_callback(&mut self, callback: AlertCallback) {
        self.callbacks.push(callback);
    }

    /// Update one alert threshold by key
    pub fn set_threshold(&mut self, key: &str, value: f64) -> anyhow::Result<()> {
        self.thresholds.set(key, value)
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Drop resolved alerts from the active map; history keeps them
    pub fn clear_resolved(&mut self) {
        self.active.retain(|_, alert| !alert.resolved);
    }
}
