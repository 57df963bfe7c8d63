//! Dwell time analysis over polygonal zones
//!
//! Tracks how long each person remains inside every configured zone.
//! A record opens on zone entry and closes on zone exit or when the
//! track vanishes from the snapshot; completed records feed per-zone
//! statistics and a sampled occupancy history.

use crate::domain::geometry::point_in_polygon;
use crate::domain::types::{Snapshot, TrackId, ZoneId};
use crate::infra::config::ZoneSpec;
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Retained completed dwell records across all zones
const COMPLETED_LOG_CAP: usize = 1000;
/// Completed records per zone considered for average/min/max
const STATS_WINDOW: usize = 50;
/// Occupancy history sample spacing
const SAMPLE_INTERVAL_SECS: f64 = 10.0;
/// Dwell beyond this multiple of the expected dwell is anomalous
const ANOMALY_RATIO: f64 = 1.5;
/// Dwell beyond this multiple is high severity
const ANOMALY_RATIO_HIGH: f64 = 2.0;
/// Anomalous dwells listed per zone summary
const ANOMALY_LIST_CAP: usize = 5;

/// One person's stay in one zone
#[derive(Debug, Clone, Serialize)]
pub struct DwellRecord {
    pub track_id: TrackId,
    pub zone_id: ZoneId,
    pub entry_time: f64,
    pub exit_time: Option<f64>,
    pub dwell_seconds: f64,
    pub is_active: bool,
}

/// Severity of an over-long dwell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DwellSeverity {
    Moderate,
    High,
}

/// An active dwell exceeding the zone's expected duration
#[derive(Debug, Clone, Serialize)]
pub struct AnomalousDwell {
    pub track_id: TrackId,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub dwell_seconds: f64,
    pub expected_seconds: f64,
    pub excess_ratio: f64,
    pub severity: DwellSeverity,
}

/// Per-zone dwell statistics
#[derive(Debug, Clone, Serialize)]
pub struct ZoneDwellStats {
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub occupancy: usize,
    pub average_dwell_seconds: f64,
    pub min_dwell_seconds: f64,
    pub max_dwell_seconds: f64,
    pub expected_dwell_seconds: f64,
    pub anomalous_count: usize,
    pub anomalous_dwells: Vec<AnomalousDwell>,
    pub total_completed: usize,
}

/// Dwell summary across all zones
#[derive(Debug, Clone, Serialize)]
pub struct DwellSummary {
    pub zones: Vec<ZoneDwellStats>,
    pub total_active_tracks: usize,
    pub total_completed_dwells: usize,
    pub timestamp: f64,
}

/// One point of a zone's sampled occupancy history
#[derive(Debug, Clone, Serialize)]
pub struct OccupancySample {
    pub timestamp: f64,
    pub relative_seconds: f64,
    pub occupancy: usize,
}

/// Per-session dwell-zone tracker
pub struct DwellTracker {
    zones: Vec<ZoneSpec>,
    active: FxHashMap<ZoneId, FxHashMap<TrackId, DwellRecord>>,
    completed: VecDeque<DwellRecord>,
}

impl DwellTracker {
    pub fn new(zones: &[ZoneSpec]) -> Self {
        let active = zones.iter().map(|z| (z.id.clone(), FxHashMap::default())).collect();
        Self { zones: zones.to_vec(), active, completed: VecDeque::new() }
    }

    /// Advance one tick: open records for zone entries, close them for
    /// exits and vanished tracks
    pub fn update(&mut self, snapshot: &Snapshot, now: f64) {
        let mut current_ids: FxHashSet<&TrackId> = FxHashSet::default();
        let mut closed = Vec::new();

        for person in &snapshot.persons {
            current_ids.insert(&person.id);
            let pos = person.position();

            for zone in &self.zones {
                let inside = point_in_polygon(pos, &zone.polygon);
                let records = self.active.entry(zone.id.clone()).or_default();
                let has_active = records.contains_key(&person.id);

                if inside && !has_active {
                    debug!(track_id = %person.id, zone_id = %zone.id, "zone_entry");
                    records.insert(
                        person.id.clone(),
                        DwellRecord {
                            track_id: person.id.clone(),
                            zone_id: zone.id.clone(),
                            entry_time: now,
                            exit_time: None,
                            dwell_seconds: 0.0,
                            is_active: true,
                        },
                    );
                } else if !inside && has_active {
                    if let Some(mut record) = records.remove(&person.id) {
                        record.exit_time = Some(now);
                        record.dwell_seconds = now - record.entry_time;
                        record.is_active = false;
                        debug!(
                            track_id = %person.id,
                            zone_id = %zone.id,
                            dwell_secs = format!("{:.1}", record.dwell_seconds),
                            "zone_exit"
                        );
                        closed.push(record);
                    }
                }
            }
        }

        // Tracks that disappeared from the snapshot count as exited
        for records in self.active.values_mut() {
            records.retain(|track_id, record| {
                if current_ids.contains(track_id) {
                    true
                } else {
                    let mut record = record.clone();
                    record.exit_time = Some(now);
                    record.dwell_seconds = now - record.entry_time;
                    record.is_active = false;
                    closed.push(record);
                    false
                }
            });
        }

        for record in closed {
            self.push_completed(record);
        }
    }

    fn push_completed(&mut self, record: DwellRecord) {
        self.completed.push_back(record);
        if self.completed.len() > COMPLETED_LOG_CAP {
            self.completed.pop_front();
        }
    }

    /// Per-zone statistics. Averages come from recent completed records,
    /// falling back to currently active durations when none completed yet.
    pub fn summary(&self, now: f64) -> DwellSummary {
        let mut zone_stats = Vec::with_capacity(self.zones.len());
        let mut total_active = 0usize;

        for zone in &self.zones {
            let active = self.active.get(&zone.id);
            let occupancy = active.map_or(0, |m| m.len());
            total_active += occupancy;

            let completed_zone: Vec<&DwellRecord> =
                self.completed.iter().filter(|r| r.zone_id == zone.id).collect();

            let active_durations: Vec<f64> = active
                .map(|m| m.values().map(|r| now - r.entry_time).collect())
                .unwrap_or_default();

            let (avg, min, max) = if completed_zone.is_empty() {
                dwell_stats(&active_durations)
            } else {
                let recent: Vec<f64> = completed_zone
                    .iter()
                    .rev()
                    .take(STATS_WINDOW)
                    .map(|r| r.dwell_seconds)
                    .collect();
                dwell_stats(&recent)
            };

            let mut anomalous = self.zone_anomalies(zone, now);
            let anomalous_count = anomalous.len();
            anomalous.truncate(ANOMALY_LIST_CAP);

            zone_stats.push(ZoneDwellStats {
                zone_id: zone.id.clone(),
                zone_name: zone.name.clone(),
                occupancy,
                average_dwell_seconds: avg,
                min_dwell_seconds: min,
                max_dwell_seconds: max,
                expected_dwell_seconds: zone.expected_dwell_secs,
                anomalous_count,
                anomalous_dwells: anomalous,
                total_completed: completed_zone.len(),
            });
        }

        DwellSummary {
            zones: zone_stats,
            total_active_tracks: total_active,
            total_completed_dwells: self.completed.len(),
            timestamp: now,
        }
    }

    fn zone_anomalies(&self, zone: &ZoneSpec, now: f64) -> Vec<AnomalousDwell> {
        let mut anomalies = Vec::new();
        if let Some(records) = self.active.get(&zone.id) {
            for record in records.values() {
                let dwell = now - record.entry_time;
                if dwell > zone.expected_dwell_secs * ANOMALY_RATIO {
                    let severity = if dwell > zone.expected_dwell_secs * ANOMALY_RATIO_HIGH {
                        DwellSeverity::High
                    } else {
                        DwellSeverity::Moderate
                    };
                    anomalies.push(AnomalousDwell {
                        track_id: record.track_id.clone(),
                        zone_id: zone.id.clone(),
                        zone_name: zone.name.clone(),
                        dwell_seconds: dwell,
                        expected_seconds: zone.expected_dwell_secs,
                        excess_ratio: dwell / zone.expected_dwell_secs,
                        severity,
                    });
                }
            }
        }
        anomalies.sort_by(|a, b| {
            b.excess_ratio.partial_cmp(&a.excess_ratio).unwrap_or(std::cmp::Ordering::Equal)
        });
        anomalies
    }

    /// All current anomalous dwells across zones, worst first
    pub fn anomalous_dwells(&self, now: f64) -> Vec<AnomalousDwell> {
        let mut anomalies: Vec<AnomalousDwell> =
            self.zones.iter().flat_map(|z| self.zone_anomalies(z, now)).collect();
        anomalies.sort_by(|a, b| {
            b.excess_ratio.partial_cmp(&a.excess_ratio).unwrap_or(std::cmp::Ordering::Equal)
        });
        anomalies
    }

    /// Occupancy over the trailing window, approximated by sampling fixed
    /// intervals and counting records whose stay covers each sample point
    pub fn occupancy_history(
        &self,
        zone_id: &ZoneId,
        window_seconds: f64,
        now: f64,
    ) -> anyhow::Result<Vec<OccupancySample>> {
        if self.zones.iter().all(|z| &z.id != zone_id) {
            bail!("unknown zone '{zone_id}'");
        }
        if window_seconds <= 0.0 {
            bail!("window_seconds must be positive, got {window_seconds}");
        }

        let cutoff = now - window_seconds;
        let mut samples = Vec::new();
        let mut t = cutoff;
        while t <= now {
            let mut count = 0usize;
            for record in self.completed.iter().filter(|r| &r.zone_id == zone_id) {
                let covers = record.entry_time <= t
                    && record.exit_time.map_or(true, |exit| exit >= t);
                if covers {
                    count += 1;
                }
            }
            if let Some(records) = self.active.get(zone_id) {
                count += records.values().filter(|r| r.entry_time <= t).count();
            }

            samples.push(OccupancySample {
                timestamp: t,
                relative_seconds: t - cutoff,
                occupancy: count,
            });
            t += SAMPLE_INTERVAL_SECS;
        }

        Ok(samples)
    }

    /// Reset one zone or all zones
    pub fn reset(&mut self, zone_id: Option<&ZoneId>) -> anyhow::Result<()> {
        match zone_id {
            Some(id) => {
                if self.zones.iter().all(|z| &z.id != id) {
                    bail!("unknown zone '{id}'");
                }
                if let Some(records) = self.active.get_mut(id) {
                    records.clear();
                }
                self.completed.retain(|r| &r.zone_id != id);
            }
            None => {
                for records in self.active.values_mut() {
                    records.clear();
                }
                self.completed.clear();
            }
        }
        Ok(())
    }
}

fn dwell_stats(durations: &[f64]) -> (f64, f64, f64) {
    if durations.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let sum: f64 = durations.iter().sum();
    let min = durations.iter().copied().fold(f64::INFINITY, f64::min);
    let max = durations.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (sum / durations.len() as f64, min, max)
}
