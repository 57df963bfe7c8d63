//! Crowd flow and counter-flow analysis
//!
//! Maintains a rolling pool of per-track displacement vectors and derives
//! the dominant flow as their magnitude-weighted average. A track moving
//! against the dominant direction beyond the configured angular threshold
//! is flagged as counter-flow, the classic precursor to crush conditions
//! in dense one-way circuits.

use crate::domain::geometry::{angle_degrees, angle_difference, Point};
use crate::domain::types::{CounterFlowSeverity, Snapshot, TrackId};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Minimum displacement magnitude to register a flow vector
const MIN_DISPLACEMENT: f64 = 0.005;
/// Displacements across a gap longer than this are discarded as stale
const MAX_GAP_SECS: f64 = 2.0;
/// Rolling pool of recent flow vectors
const HISTORY_CAP: usize = 100;
/// Most recent vectors considered for the dominant flow
const DOMINANT_WINDOW: usize = 50;
/// Direction heat-grid resolution (cells per axis)
const GRID_SIZE: usize = 50;
/// Retained counter-flow events
const EVENT_LOG_CAP: usize = 500;
/// Tracks silent for longer than this are forgotten
const TRACK_TTL_SECS: f64 = 30.0;

/// Severity tier bounds (deviation degrees, displacement magnitude)
const SEVERE_DEVIATION: f64 = 160.0;
const SEVERE_MAGNITUDE: f64 = 0.02;
const MODERATE_DEVIATION: f64 = 140.0;
const MODERATE_MAGNITUDE: f64 = 0.015;

/// A movement flow vector: unit direction plus magnitude and angle
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlowVector {
    pub x: f64,
    pub y: f64,
    pub magnitude: f64,
    /// Degrees, 0 = right, 90 = down
    pub angle: f64,
}

impl FlowVector {
    /// 8-way compass label for the vector's angle
    pub fn compass_direction(&self) -> &'static str {
        const DIRECTIONS: [&str; 8] = [
            "right",
            "down-right",
            "down",
            "down-left",
            "left",
            "up-left",
            "up",
            "up-right",
        ];
        let idx = ((self.angle + 22.5) / 45.0) as usize % 8;
        DIRECTIONS[idx]
    }
}

/// A counter-flow detection event
#[derive(Debug, Clone, Serialize)]
pub struct CounterFlowEvent {
    pub track_id: TrackId,
    pub timestamp: f64,
    pub position: Point,
    pub movement_angle: f64,
    pub dominant_flow_angle: f64,
    pub deviation_angle: f64,
    pub severity: CounterFlowSeverity,
}

/// Per-severity event counts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeverityBreakdown {
    pub mild: usize,
    pub moderate: usize,
    pub severe: usize,
}

/// Counter-flow summary for queries and the merged tick result
#[derive(Debug, Clone, Serialize)]
pub struct CounterFlowSummary {
    pub total_events: usize,
    pub severity_breakdown: SeverityBreakdown,
    pub recent_events: Vec<CounterFlowEvent>,
    pub dominant_flow: Option<FlowVector>,
}

/// One occupied cell of the direction heat grid
#[derive(Debug, Clone, Serialize)]
pub struct FlowGridCell {
    pub x: usize,
    pub y: usize,
    pub count: u32,
    /// Circular mean of observed movement angles
    pub angle: f64,
    /// count/10 capped at 1.0
    pub intensity: f64,
}

/// Sparse snapshot of the direction heat grid
#[derive(Debug, Clone, Serialize)]
pub struct FlowGrid {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<FlowGridCell>,
}

/// Per-tick flow analysis output
#[derive(Debug, Clone, Serialize)]
pub struct FlowTickResult {
    pub dominant_flow: Option<FlowVector>,
    pub current_vector_count: usize,
    pub counter_flow_detected: bool,
    pub counter_flow_events: Vec<CounterFlowEvent>,
    pub total_counter_flow_count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct GridCell {
    count: u32,
    /// Running circular averages; sin/cos components sidestep the
    /// 0/360 wraparound that plain angle averaging suffers
    avg_sin: f64,
    avg_cos: f64,
}

struct LastSeen {
    position: Point,
    time: f64,
}

/// Per-session flow analyzer
pub struct FlowAnalyzer {
    /// Minimum angular deviation (degrees) to flag counter-flow
    angle_threshold: f64,
    last_positions: FxHashMap<TrackId, LastSeen>,
    flow_history: VecDeque<FlowVector>,
    counter_flow_events: VecDeque<CounterFlowEvent>,
    dominant_flow: Option<FlowVector>,
    grid: Vec<GridCell>,
}

impl FlowAnalyzer {
    pub fn new(angle_threshold: f64) -> Self {
        Self {
            angle_threshold,
            last_positions: FxHashMap::default(),
            flow_history: VecDeque::with_capacity(HISTORY_CAP),
            counter_flow_events: VecDeque::new(),
            dominant_flow: None,
            grid: vec![GridCell::default(); GRID_SIZE * GRID_SIZE],
        }
    }

    /// Advance one tick. Counter-flow is judged against the dominant flow
    /// established by earlier ticks; the dominant flow is then recomputed
    /// from the updated vector pool.
    pub fn update(&mut self, snapshot: &Snapshot, now: f64) -> FlowTickResult {
        let mut current_vectors = 0usize;
        let mut new_events = Vec::new();

        for person in &snapshot.persons {
            let pos = person.position();

            if let Some(last) = self.last_positions.get(&person.id) {
                let dt = now - last.time;
                if dt > 0.0 && dt < MAX_GAP_SECS {
                    let dx = pos.x - last.position.x;
                    let dy = pos.y - last.position.y;
                    let magnitude = (dx * dx + dy * dy).sqrt();

                    if magnitude > MIN_DISPLACEMENT {
                        let angle = angle_degrees(dx, dy);
                        let vector = FlowVector {
                            x: dx / magnitude,
                            y: dy / magnitude,
                            magnitude,
                            angle,
                        };
                        current_vectors += 1;

                        self.update_grid(pos, angle);

                        if let Some(dominant) = self.dominant_flow {
                            let deviation = angle_difference(angle, dominant.angle);
                            if deviation > self.angle_threshold {
                                let severity = classify_severity(deviation, magnitude);
                                let event = CounterFlowEvent {
                                    track_id: person.id.clone(),
                                    timestamp: now,
                                    position: pos,
                                    movement_angle: angle,
                                    dominant_flow_angle: dominant.angle,
                                    deviation_angle: deviation,
                                    severity,
                                };
                                debug!(
                                    track_id = %event.track_id,
                                    deviation = format!("{:.1}", deviation),
                                    severity = severity.as_str(),
                                    "counter_flow"
                                );
                                self.counter_flow_events.push_back(event.clone());
                                if self.counter_flow_events.len() > EVENT_LOG_CAP {
                                    self.counter_flow_events.pop_front();
                                }
                                new_events.push(event);
                            }
                        }

                        self.flow_history.push_back(vector);
                        if self.flow_history.len() > HISTORY_CAP {
                            self.flow_history.pop_front();
                        }
                    }
                }
            }

            self.last_positions.insert(person.id.clone(), LastSeen { position: pos, time: now });
        }

        self.last_positions.retain(|_, last| now - last.time <= TRACK_TTL_SECS);
        self.dominant_flow = self.calculate_dominant_flow();

        FlowTickResult {
            dominant_flow: self.dominant_flow,
            current_vector_count: current_vectors,
            counter_flow_detected: !new_events.is_empty(),
            counter_flow_events: new_events,
            total_counter_flow_count: self.counter_flow_events.len(),
        }
    }

    /// Magnitude-weighted vector average over the most recent window,
    /// renormalized to a unit direction
    fn calculate_dominant_flow(&self) -> Option<FlowVector> {
        let recent: Vec<&FlowVector> = self
            .flow_history
            .iter()
            .rev()
            .take(DOMINANT_WINDOW)
            .collect();
        if recent.is_empty() {
            return None;
        }

        let total_weight: f64 = recent.iter().map(|v| v.magnitude).sum();
        if total_weight == 0.0 {
            return None;
        }

        let avg_x: f64 = recent.iter().map(|v| v.x * v.magnitude).sum::<f64>() / total_weight;
        let avg_y: f64 = recent.iter().map(|v| v.y * v.magnitude).sum::<f64>() / total_weight;

        let magnitude = (avg_x * avg_x + avg_y * avg_y).sqrt();
        if magnitude > 0.0 {
            Some(FlowVector {
                x: avg_x / magnitude,
                y: avg_y / magnitude,
                magnitude,
                angle: angle_degrees(avg_x, avg_y),
            })
        } else {
            None
        }
    }

    fn update_grid(&mut self, pos: Point, angle: f64) {
        let gx = ((pos.x * GRID_SIZE as f64) as usize).min(GRID_SIZE - 1);
        let gy = ((pos.y * GRID_SIZE as f64) as usize).min(GRID_SIZE - 1);
        let cell = &mut self.grid[gy * GRID_SIZE + gx];

        let rad = angle.to_radians();
        let count = cell.count as f64;
        cell.avg_sin = (cell.avg_sin * count + rad.sin()) / (count + 1.0);
        cell.avg_cos = (cell.avg_cos * count + rad.cos()) / (count + 1.0);
        cell.count += 1;
    }

    /// Current dominant flow, if any movement has been observed
    pub fn dominant_flow(&self) -> Option<FlowVector> {
        self.dominant_flow
    }

    /// Sparse heat-grid snapshot; each occupied cell reports its circular
    /// mean angle and a normalized intensity
    pub fn direction_grid(&self) -> FlowGrid {
        let mut cells = Vec::new();
        for gy in 0..GRID_SIZE {
            for gx in 0..GRID_SIZE {
                let cell = &self.grid[gy * GRID_SIZE + gx];
                if cell.count == 0 {
                    continue;
                }
                let angle = angle_degrees(cell.avg_cos, cell.avg_sin);
                cells.push(FlowGridCell {
                    x: gx,
                    y: gy,
                    count: cell.count,
                    angle,
                    intensity: (cell.count as f64 / 10.0).min(1.0),
                });
            }
        }
        FlowGrid { width: GRID_SIZE, height: GRID_SIZE, cells }
    }

    /// Summary of counter-flow activity with the ten most recent events
    pub fn counter_flow_summary(&self) -> CounterFlowSummary {
        let mut breakdown = SeverityBreakdown::default();
        for event in &self.counter_flow_events {
            match event.severity {
                CounterFlowSeverity::Mild => breakdown.mild += 1,
                CounterFlowSeverity::Moderate => breakdown.moderate += 1,
                CounterFlowSeverity::Severe => breakdown.severe += 1,
            }
        }

        CounterFlowSummary {
            total_events: self.counter_flow_events.len(),
            severity_breakdown: breakdown,
            recent_events: self.counter_flow_events.iter().rev().take(10).cloned().collect(),
            dominant_flow: self.dominant_flow,
        }
    }

    /// Clear all flow state
    pub fn reset(&mut self) {
        self.last_positions.clear();
        self.flow_history.clear();
        self.counter_flow_events.clear();
        self.dominant_flow = None;
        self.grid.fill(GridCell::default());
    }
}

fn classify_severity(deviation: f64, magnitude: f64) -> CounterFlowSeverity {
    if deviation > SEVERE_DEVIATION && magnitude > SEVERE_MAGNITUDE {
        CounterFlowSeverity::Severe
    } else if deviation > MODERATE_DEVIATION || magnitude > MODERATE_MAGNITUDE {
        CounterFlowSeverity::Moderate
    } else {
        CounterFlowSeverity::Mild
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TrackedPerson;

    fn person(id: &str, x: f64, y: f64) -> TrackedPerson {
        TrackedPerson { id: TrackId::from(id), x, y, ..Default::default() }
    }

    fn snapshot(persons: Vec<TrackedPerson>) -> Snapshot {
        Snapshot { persons, crowd_velocity: 1.0, timestamp: 0.0 }
    }

    /// Drive several tracks rightward to establish a rightward dominant flow
    fn establish_rightward_flow(analyzer: &mut FlowAnalyzer, ticks: usize) {
        for tick in 0..ticks {
            let t = tick as f64 * 0.2;
            let persons = (0..4)
                .map(|i| {
                    person(&format!("W{i:02}"), 0.1 + tick as f64 * 0.01, 0.2 + i as f64 * 0.1)
                })
                .collect();
            analyzer.update(&snapshot(persons), t);
        }
    }

    #[test]
    fn test_dominant_flow_direction() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        establish_rightward_flow(&mut analyzer, 5);

        let dominant = analyzer.dominant_flow().unwrap();
        assert!(dominant.angle < 1.0 || dominant.angle > 359.0, "angle = {}", dominant.angle);
        assert!((dominant.x - 1.0).abs() < 1e-6);
        assert_eq!(dominant.compass_direction(), "right");
    }

    #[test]
    fn test_counter_flow_flagged() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        establish_rightward_flow(&mut analyzer, 5);

        // One track walks straight left against the stream
        analyzer.update(&snapshot(vec![person("C1", 0.8, 0.5)]), 10.0);
        let result = analyzer.update(&snapshot(vec![person("C1", 0.79, 0.5)]), 10.2);

        assert!(result.counter_flow_detected);
        let event = &result.counter_flow_events[0];
        assert_eq!(event.track_id.as_str(), "C1");
        assert!((event.deviation_angle - 180.0).abs() < 1.0);
        assert!(event.deviation_angle <= 180.0);
        // 0.01 displacement: deviation > 140 but magnitude small
        assert_eq!(event.severity, CounterFlowSeverity::Moderate);
    }

    #[test]
    fn test_severe_counter_flow() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        establish_rightward_flow(&mut analyzer, 5);

        analyzer.update(&snapshot(vec![person("C1", 0.8, 0.5)]), 10.0);
        let result = analyzer.update(&snapshot(vec![person("C1", 0.75, 0.5)]), 10.2);

        assert_eq!(result.counter_flow_events[0].severity, CounterFlowSeverity::Severe);
    }

    #[test]
    fn test_aligned_movement_not_flagged() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        establish_rightward_flow(&mut analyzer, 5);

        analyzer.update(&snapshot(vec![person("A1", 0.3, 0.5)]), 10.0);
        let result = analyzer.update(&snapshot(vec![person("A1", 0.32, 0.5)]), 10.2);
        assert!(!result.counter_flow_detected);
    }

    #[test]
    fn test_tiny_displacement_ignored() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        analyzer.update(&snapshot(vec![person("S1", 0.5, 0.5)]), 0.0);
        let result = analyzer.update(&snapshot(vec![person("S1", 0.501, 0.5)]), 0.2);

        assert_eq!(result.current_vector_count, 0);
        assert!(analyzer.dominant_flow().is_none());
    }

    #[test]
    fn test_stale_gap_discarded() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        analyzer.update(&snapshot(vec![person("S1", 0.1, 0.5)]), 0.0);
        // Large displacement but across a 5 second gap
        let result = analyzer.update(&snapshot(vec![person("S1", 0.5, 0.5)]), 5.0);

        assert_eq!(result.current_vector_count, 0);
        assert!(analyzer.dominant_flow().is_none());
    }

    #[test]
    fn test_severity_breakdown_counts() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        establish_rightward_flow(&mut analyzer, 5);

        analyzer.update(&snapshot(vec![person("C1", 0.8, 0.5), person("C2", 0.7, 0.3)]), 10.0);
        analyzer.update(
            &snapshot(vec![person("C1", 0.79, 0.5), person("C2", 0.65, 0.3)]),
            10.2,
        );

        let summary = analyzer.counter_flow_summary();
        assert_eq!(summary.total_events, 2);
        assert_eq!(summary.severity_breakdown.moderate, 1);
        assert_eq!(summary.severity_breakdown.severe, 1);
        assert_eq!(summary.recent_events.len(), 2);
    }

    #[test]
    fn test_grid_circular_mean() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        // Two samples straddling the 0/360 wrap in the same cell
        analyzer.update_grid(Point::new(0.5, 0.5), 350.0);
        analyzer.update_grid(Point::new(0.5, 0.5), 10.0);

        let grid = analyzer.direction_grid();
        assert_eq!(grid.cells.len(), 1);
        let cell = &grid.cells[0];
        assert_eq!(cell.count, 2);
        // Naive averaging would give 180; circular mean gives ~0
        assert!(cell.angle < 1.0 || cell.angle > 359.0, "angle = {}", cell.angle);
        assert_eq!(cell.intensity, 0.2);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut analyzer = FlowAnalyzer::new(120.0);
        establish_rightward_flow(&mut analyzer, 5);
        assert!(analyzer.dominant_flow().is_some());

        analyzer.reset();
        assert!(analyzer.dominant_flow().is_none());
        assert_eq!(analyzer.counter_flow_summary().total_events, 0);
        assert!(analyzer.direction_grid().cells.is_empty());
    }

    #[test]
    fn test_compass_labels() {
        let labels = [
            (0.0, "right"),
            (45.0, "down-right"),
            (90.0, "down"),
            (180.0, "left"),
            (270.0, "up"),
            (315.0, "up-right"),
        ];
        for (angle, expected) in labels {
            let v = FlowVector { x: 0.0, y: 0.0, magnitude: 1.0, angle };
            assert_eq!(v.compass_direction(), expected, "angle {angle}");
        }
    }
}
