//! Behavioral anomaly detection for crowd safety
//!
//! Four heuristic checks run over bounded per-track histories and a
//! rolling crowd-velocity baseline:
//! - fall: aspect-ratio jump, bounding-box collapse, downward motion
//! - sudden stop: a moving track halting while the crowd keeps moving
//! - stationary person: near-zero displacement against a moving baseline
//! - crowd surge: scene-wide velocity spiking over the trailing average
//!
//! Velocities here are in normalized frame units per second, independent
//! of the metric crowd-velocity estimate used for congestion metrics.

use crate::domain::geometry::Point;
use crate::domain::types::{AnomalySeverity, AnomalyType, Snapshot, TrackId};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use tracing::debug;

/// Aspect ratio floor before a box is considered fall-shaped
const FALL_ASPECT_FLOOR: f64 = 1.0;
/// Minimum movement (units/sec) to not count as stopped
const SUDDEN_STOP_VELOCITY: f64 = 0.005;
/// Ticks between the "was moving" probe and the present
const SUDDEN_STOP_WINDOW: usize = 5;
/// Per-tick displacement below this is stationary
const STATIONARY_THRESHOLD: f64 = 0.002;
/// Ticks of near-zero displacement before a stationary event
const STATIONARY_WINDOW: usize = 10;
/// Surge fires when current velocity exceeds this multiple of baseline
const SURGE_MULTIPLIER: f64 = 2.5;
/// Velocity baseline samples considered for surge detection
const SURGE_BASELINE_WINDOW: usize = 50;
/// Observations retained per track
const TRACK_HISTORY_CAP: usize = 100;
/// Crowd velocity samples retained
const VELOCITY_HISTORY_CAP: usize = 200;
/// Anomaly events retained
const EVENT_LOG_CAP: usize = 500;
/// Repeat suppression window for stationary events, per track
const STATIONARY_DEDUP_SECS: f64 = 30.0;
/// Repeat suppression window for surge events
const SURGE_DEDUP_SECS: f64 = 60.0;
/// Tracks silent for longer than this are forgotten
const TRACK_TTL_SECS: f64 = 30.0;

/// A detected behavioral anomaly
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub event_id: String,
    pub event_type: AnomalyType,
    pub timestamp: f64,
    pub position: Point,
    pub track_id: Option<TrackId>,
    pub confidence: f64,
    pub severity: AnomalySeverity,
    pub details: serde_json::Value,
}

/// Per-type event counts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AnomalyTypeCounts {
    pub fall: usize,
    pub sudden_stop: usize,
    pub stationary_person: usize,
    pub crowd_surge: usize,
}

/// Per-severity event counts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AnomalySeverityCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

/// Summary over the retained event log
#[derive(Debug, Clone, Serialize)]
pub struct AnomalySummary {
    pub total_events: usize,
    pub by_type: AnomalyTypeCounts,
    pub by_severity: AnomalySeverityCounts,
    pub recent_critical: Vec<AnomalyEvent>,
    pub average_crowd_velocity: f64,
}

/// Per-tick anomaly output
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyTickResult {
    pub new_events: Vec<AnomalyEvent>,
    pub total_events: usize,
    pub average_crowd_velocity: f64,
    pub active_tracks: usize,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    pos: Point,
    width: f64,
    height: f64,
    timestamp: f64,
}

impl Observation {
    fn aspect_ratio(&self) -> f64 {
        if self.height == 0.0 {
            0.0
        } else {
            self.width / self.height
        }
    }
}

/// Per-session anomaly detector
pub struct AnomalyDetector {
    histories: FxHashMap<TrackId, VecDeque<Observation>>,
    events: VecDeque<AnomalyEvent>,
    event_counter: u64,
    /// Average per-track velocity of the previous tick
    average_crowd_velocity: f64,
    velocity_history: VecDeque<f64>,
    last_stationary: FxHashMap<TrackId, f64>,
    last_surge: Option<f64>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            histories: FxHashMap::default(),
            events: VecDeque::new(),
            event_counter: 0,
            average_crowd_velocity: 0.0,
            velocity_history: VecDeque::with_capacity(VELOCITY_HISTORY_CAP),
            last_stationary: FxHashMap::default(),
            last_surge: None,
        }
    }

    fn next_event_id(&mut self) -> String {
        self.event_counter += 1;
        format!("ANM{:05}", self.event_counter)
    }

    /// Advance one tick, running all per-track checks plus the
    /// crowd-level surge check
    pub fn update(&mut self, snapshot: &Snapshot, now: f64) -> AnomalyTickResult {
        let mut new_events = Vec::new();
        let mut frame_velocities = Vec::new();

        for person in &snapshot.persons {
            let current = Observation {
                pos: person.position(),
                width: person.width,
                height: person.height,
                timestamp: now,
            };

            let history = self.histories.entry(person.id.clone()).or_default();

            if let Some(prev) = history.back() {
                let dt = now - prev.timestamp;
                if dt > 0.0 {
                    frame_velocities.push(prev.pos.distance(current.pos) / dt);
                }
            }

            let mut triggered: Vec<AnomalyEvent> = Vec::new();
            if let Some(event) = check_fall(history, &current) {
                triggered.push(event);
            }
            if let Some(event) =
                check_sudden_stop(history, &current, self.average_crowd_velocity)
            {
                triggered.push(event);
            }
            if let Some(event) = check_stationary(history, self.average_crowd_velocity, now) {
                let suppressed = self
                    .last_stationary
                    .get(&person.id)
                    .is_some_and(|&t| now - t < STATIONARY_DEDUP_SECS);
                if !suppressed {
                    self.last_stationary.insert(person.id.clone(), now);
                    triggered.push(event);
                }
            }

            history.push_back(current);
            if history.len() > TRACK_HISTORY_CAP {
                history.pop_front();
            }

            for mut event in triggered {
                event.event_id = self.next_event_id();
                event.track_id = Some(person.id.clone());
                debug!(
                    event_id = %event.event_id,
                    event_type = event.event_type.as_str(),
                    track_id = %person.id,
                    confidence = format!("{:.2}", event.confidence),
                    "anomaly_detected"
                );
                new_events.push(event);
            }
        }

        if !frame_velocities.is_empty() {
            let current_avg =
                frame_velocities.iter().sum::<f64>() / frame_velocities.len() as f64;
            self.average_crowd_velocity = current_avg;
            self.velocity_history.push_back(current_avg);
            if self.velocity_history.len() > VELOCITY_HISTORY_CAP {
                self.velocity_history.pop_front();
            }

            if let Some(mut event) = self.check_crowd_surge(current_avg, now) {
                let suppressed =
                    self.last_surge.is_some_and(|t| now - t < SURGE_DEDUP_SECS);
                if !suppressed {
                    self.last_surge = Some(now);
                    event.event_id = self.next_event_id();
                    debug!(
                        event_id = %event.event_id,
                        confidence = format!("{:.2}", event.confidence),
                        "crowd_surge_detected"
                    );
                    new_events.push(event);
                }
            }
        }

        self.histories
            .retain(|_, history| history.back().is_some_and(|o| now - o.timestamp <= TRACK_TTL_SECS));
        self.last_stationary.retain(|_, &mut t| now - t <= STATIONARY_DEDUP_SECS);

        for event in &new_events {
            self.events.push_back(event.clone());
            if self.events.len() > EVENT_LOG_CAP {
                self.events.pop_front();
            }
        }

        AnomalyTickResult {
            new_events,
            total_events: self.events.len(),
            average_crowd_velocity: self.average_crowd_velocity,
            active_tracks: self.histories.len(),
        }
    }

    fn check_crowd_surge(&mut self, current_avg: f64, now: f64) -> Option<AnomalyEvent> {
        if self.velocity_history.is_empty() {
            return None;
        }
        let baseline: Vec<f64> = self
            .velocity_history
            .iter()
            .rev()
            .take(SURGE_BASELINE_WINDOW)
            .copied()
            .collect();
        let historical_avg = baseline.iter().sum::<f64>() / baseline.len() as f64;

        if historical_avg > 0.0 && current_avg > historical_avg * SURGE_MULTIPLIER {
            Some(AnomalyEvent {
                event_id: String::new(),
                event_type: AnomalyType::CrowdSurge,
                timestamp: now,
                position: Point::new(0.5, 0.5), // scene-wide, center of frame
                track_id: None,
                confidence: (current_avg / (historical_avg * 3.0)).min(1.0),
                severity: AnomalySeverity::High,
                details: json!({
                    "current_velocity": current_avg,
                    "historical_velocity": historical_avg,
                    "surge_ratio": current_avg / historical_avg,
                }),
            })
        } else {
            None
        }
    }

    /// Events newer than the age window, newest first
    pub fn recent_events(&self, max_age_seconds: f64, now: f64) -> Vec<AnomalyEvent> {
        let cutoff = now - max_age_seconds;
        self.events.iter().rev().filter(|e| e.timestamp > cutoff).cloned().collect()
    }

    /// Counts by type and severity over the retained log
    pub fn summary(&self) -> AnomalySummary {
        let mut by_type = AnomalyTypeCounts::default();
        let mut by_severity = AnomalySeverityCounts::default();

        for event in &self.events {
            match event.event_type {
                AnomalyType::Fall => by_type.fall += 1,
                AnomalyType::SuddenStop => by_type.sudden_stop += 1,
                AnomalyType::StationaryPerson => by_type.stationary_person += 1,
                AnomalyType::CrowdSurge => by_type.crowd_surge += 1,
            }
            match event.severity {
                AnomalySeverity::Low => by_severity.low += 1,
                AnomalySeverity::Medium => by_severity.medium += 1,
                AnomalySeverity::High => by_severity.high += 1,
                AnomalySeverity::Critical => by_severity.critical += 1,
            }
        }

        let recent_critical = self
            .events
            .iter()
            .rev()
            .filter(|e| e.severity >= AnomalySeverity::High)
            .take(10)
            .cloned()
            .collect();

        AnomalySummary {
            total_events: self.events.len(),
            by_type,
            by_severity,
            recent_critical,
            average_crowd_velocity: self.average_crowd_velocity,
        }
    }

    /// Clear all detector state
    pub fn reset(&mut self) {
        self.histories.clear();
        self.events.clear();
        self.velocity_history.clear();
        self.last_stationary.clear();
        self.last_surge = None;
        self.average_crowd_velocity = 0.0;
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Score fall indicators against the track's recent average shape.
/// Aspect-ratio blowup and box collapse weigh 2 points each, a downward
/// jump 1; three points trigger with confidence = points/5.
fn check_fall(history: &VecDeque<Observation>, current: &Observation) -> Option<AnomalyEvent> {
    if history.len() < 5 {
        return None;
    }

    let recent: Vec<&Observation> = history.iter().rev().take(10).collect();
    let n = recent.len() as f64;
    let avg_aspect = recent.iter().map(|o| o.aspect_ratio()).sum::<f64>() / n;
    let avg_height = recent.iter().map(|o| o.height).sum::<f64>() / n;
    let avg_y = recent.iter().map(|o| o.pos.y).sum::<f64>() / n;

    let current_aspect = current.aspect_ratio();
    let mut indicators = 0u32;
    let mut details = serde_json::Map::new();

    // Person goes horizontal
    if current_aspect > avg_aspect * 1.5 && current_aspect > FALL_ASPECT_FLOOR {
        indicators += 2;
        details.insert(
            "aspect_change".to_string(),
            json!(format!("{avg_aspect:.2} -> {current_aspect:.2}")),
        );
    }
    // Bounding box collapses
    if avg_height > 0.0 && current.height < avg_height * 0.6 {
        indicators += 2;
        details.insert(
            "height_reduction".to_string(),
            json!(format!("{avg_height:.1} -> {:.1}", current.height)),
        );
    }
    // Sudden downward movement
    if current.pos.y > avg_y * 1.2 && current.pos.y > 0.0 {
        indicators += 1;
        details.insert("downward_motion".to_string(), json!(true));
    }

    if indicators >= 3 {
        let confidence = (indicators as f64 / 5.0).min(1.0);
        let severity = if confidence > 0.8 {
            AnomalySeverity::Critical
        } else if confidence > 0.6 {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        };
        Some(AnomalyEvent {
            event_id: String::new(),
            event_type: AnomalyType::Fall,
            timestamp: current.timestamp,
            position: current.pos,
            track_id: None,
            confidence,
            severity,
            details: serde_json::Value::Object(details),
        })
    } else {
        None
    }
}

/// A track that was moving faster than 3x the minimal-motion threshold a
/// few ticks ago and now sits below it, while the crowd overall still
/// moves above 2x the threshold
fn check_sudden_stop(
    history: &VecDeque<Observation>,
    current: &Observation,
    crowd_velocity: f64,
) -> Option<AnomalyEvent> {
    if history.len() < SUDDEN_STOP_WINDOW + 5 {
        return None;
    }

    let last = history.back()?;
    let dt = current.timestamp - last.timestamp;
    if dt <= 0.0 {
        return None;
    }
    let current_velocity = last.pos.distance(current.pos) / dt;

    // Velocity before the potential stop
    let len = history.len();
    let older_a = history.get(len - SUDDEN_STOP_WINDOW - 2)?;
    let older_b = history.get(len - SUDDEN_STOP_WINDOW - 1)?;
    let old_dt = older_b.timestamp - older_a.timestamp;
    if old_dt <= 0.0 {
        return None;
    }
    let previous_velocity = older_a.pos.distance(older_b.pos) / old_dt;

    let was_moving = previous_velocity > SUDDEN_STOP_VELOCITY * 3.0;
    let now_stopped = current_velocity < SUDDEN_STOP_VELOCITY;
    let crowd_moving = crowd_velocity > SUDDEN_STOP_VELOCITY * 2.0;

    if was_moving && now_stopped && crowd_moving {
        Some(AnomalyEvent {
            event_id: String::new(),
            event_type: AnomalyType::SuddenStop,
            timestamp: current.timestamp,
            position: current.pos,
            track_id: None,
            confidence: 0.7,
            severity: AnomalySeverity::Medium,
            details: json!({
                "previous_velocity": previous_velocity,
                "current_velocity": current_velocity,
                "crowd_velocity": crowd_velocity,
            }),
        })
    } else {
        None
    }
}

/// Average per-tick displacement over the stationary window below a tiny
/// threshold, while the crowd baseline indicates motion 3x that threshold
fn check_stationary(
    history: &VecDeque<Observation>,
    crowd_velocity: f64,
    now: f64,
) -> Option<AnomalyEvent> {
    if history.len() < STATIONARY_WINDOW {
        return None;
    }

    let recent: Vec<&Observation> =
        history.iter().skip(history.len() - STATIONARY_WINDOW).collect();
    let total_movement: f64 =
        recent.windows(2).map(|pair| pair[0].pos.distance(pair[1].pos)).sum();
    let avg_movement = total_movement / recent.len() as f64;

    if avg_movement < STATIONARY_THRESHOLD && crowd_velocity > STATIONARY_THRESHOLD * 3.0 {
        let latest = recent[recent.len() - 1];
        Some(AnomalyEvent {
            event_id: String::new(),
            event_type: AnomalyType::StationaryPerson,
            timestamp: now,
            position: latest.pos,
            track_id: None,
            confidence: 0.6,
            severity: AnomalySeverity::Low,
            details: json!({
                "stationary_ticks": STATIONARY_WINDOW,
                "avg_movement": avg_movement,
                "crowd_velocity": crowd_velocity,
            }),
        })
    } else {
        None
    }
}
