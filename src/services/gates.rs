//! Bi-directional gate counting over virtual counting lines
//!
//! A gate is a line segment with a designated entry side. A crossing is
//! detected when a track's movement segment (previous position to current
//! position) properly intersects the gate line; the dot product of the
//! displacement against the gate's entry direction classifies it.
//!
//! Each track is counted at most once per gate until the gate is reset.

use crate::domain::geometry::{segments_intersect, Point};
use crate::domain::types::{GateId, Snapshot, TrackId};
use crate::infra::config::GateSpec;
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Positions retained per track
const TRAIL_LEN: usize = 30;
/// Retained crossing events across all gates
const CROSSING_LOG_CAP: usize = 1000;
/// Tracks silent for longer than this are forgotten
const TRACK_TTL_SECS: f64 = 30.0;

/// Crossing direction relative to the gate's configured entry side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingDirection {
    Entry,
    Exit,
}

impl CrossingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingDirection::Entry => "entry",
            CrossingDirection::Exit => "exit",
        }
    }
}

/// A recorded gate crossing event
#[derive(Debug, Clone, Serialize)]
pub struct GateCrossing {
    pub track_id: TrackId,
    pub gate_id: GateId,
    pub direction: CrossingDirection,
    pub position: Point,
    pub timestamp: f64,
}

/// Counters for one gate
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub gate_id: GateId,
    pub entry_count: u64,
    pub exit_count: u64,
    pub net_count: i64,
    pub total_crossings: u64,
}

/// Windowed per-minute crossing rates for one gate
#[derive(Debug, Clone, Serialize)]
pub struct GateFlowRate {
    pub gate_id: GateId,
    pub entry_rate: f64,
    pub exit_rate: f64,
    pub net_rate: f64,
    pub window_seconds: f64,
}

struct Gate {
    spec: GateSpec,
    entry_count: u64,
    exit_count: u64,
    /// Tracks already counted for this gate (until reset)
    crossed: FxHashSet<TrackId>,
}

impl Gate {
    fn new(spec: GateSpec) -> Self {
        Self { spec, entry_count: 0, exit_count: 0, crossed: FxHashSet::default() }
    }

    fn stats(&self) -> GateStats {
        GateStats {
            gate_id: self.spec.id.clone(),
            entry_count: self.entry_count,
            exit_count: self.exit_count,
            net_count: self.entry_count as i64 - self.exit_count as i64,
            total_crossings: self.entry_count + self.exit_count,
        }
    }
}

struct Trail {
    positions: VecDeque<(Point, f64)>,
    last_seen: f64,
}

/// Per-session gate crossing engine
pub struct GateCounter {
    gates: Vec<Gate>,
    trails: FxHashMap<TrackId, Trail>,
    crossings: VecDeque<GateCrossing>,
}

impl GateCounter {
    pub fn new(specs: &[GateSpec]) -> Self {
        Self {
            gates: specs.iter().cloned().map(Gate::new).collect(),
            trails: FxHashMap::default(),
            crossings: VecDeque::new(),
        }
    }

    /// Advance one tick. Returns the crossings newly detected this tick.
    pub fn update(&mut self, snapshot: &Snapshot, now: f64) -> Vec<GateCrossing> {
        let mut new_crossings = Vec::new();

        for person in &snapshot.persons {
            let pos = person.position();
            let prev = self
                .trails
                .get(&person.id)
                .and_then(|t| t.positions.back())
                .map(|&(p, _)| p);

            if let Some(prev_pos) = prev {
                for gate in &mut self.gates {
                    if gate.crossed.contains(&person.id) {
                        continue;
                    }
                    if !segments_intersect(prev_pos, pos, gate.spec.line.0, gate.spec.line.1) {
                        continue;
                    }

                    let direction = classify_direction(prev_pos, pos, gate.spec.entry_direction);
                    match direction {
                        CrossingDirection::Entry => gate.entry_count += 1,
                        CrossingDirection::Exit => gate.exit_count += 1,
                    }
                    gate.crossed.insert(person.id.clone());

                    let crossing = GateCrossing {
                        track_id: person.id.clone(),
                        gate_id: gate.spec.id.clone(),
                        direction,
                        position: pos,
                        timestamp: now,
                    };
                    debug!(
                        track_id = %crossing.track_id,
                        gate_id = %crossing.gate_id,
                        direction = crossing.direction.as_str(),
                        "gate_crossing"
                    );
                    self.crossings.push_back(crossing.clone());
                    if self.crossings.len() > CROSSING_LOG_CAP {
                        self.crossings.pop_front();
                    }
                    new_crossings.push(crossing);
                }
            }

            let trail = self
                .trails
                .entry(person.id.clone())
                .or_insert_with(|| Trail { positions: VecDeque::with_capacity(TRAIL_LEN), last_seen: now });
            trail.positions.push_back((pos, now));
            if trail.positions.len() > TRAIL_LEN {
                trail.positions.pop_front();
            }
            trail.last_seen = now;
        }

        self.trails.retain(|_, trail| now - trail.last_seen <= TRACK_TTL_SECS);

        new_crossings
    }

    /// Counters for every configured gate
    pub fn gate_stats(&self) -> Vec<GateStats> {
        self.gates.iter().map(Gate::stats).collect()
    }

    /// Counters for one gate
    pub fn gate_stats_for(&self, gate_id: &GateId) -> anyhow::Result<GateStats> {
        match self.gates.iter().find(|g| &g.spec.id == gate_id) {
            Some(gate) => Ok(gate.stats()),
            None => bail!("unknown gate '{gate_id}'"),
        }
    }

    /// Entry/exit/net rate over the trailing window, scaled to per-minute
    pub fn flow_rate(
        &self,
        gate_id: &GateId,
        window_seconds: f64,
        now: f64,
    ) -> anyhow::Result<GateFlowRate> {
        if self.gates.iter().all(|g| &g.spec.id != gate_id) {
            bail!("unknown gate '{gate_id}'");
        }
        if window_seconds <= 0.0 {
            bail!("window_seconds must be positive, got {window_seconds}");
        }

        let cutoff = now - window_seconds;
        let mut entries = 0u64;
        let mut exits = 0u64;
        for c in self.crossings.iter().filter(|c| &c.gate_id == gate_id && c.timestamp > cutoff) {
            match c.direction {
                CrossingDirection::Entry => entries += 1,
                CrossingDirection::Exit => exits += 1,
            }
        }

        let rate_multiplier = 60.0 / window_seconds;
        Ok(GateFlowRate {
            gate_id: gate_id.clone(),
            entry_rate: entries as f64 * rate_multiplier,
            exit_rate: exits as f64 * rate_multiplier,
            net_rate: (entries as f64 - exits as f64) * rate_multiplier,
            window_seconds,
        })
    }

    /// Most recent crossings, newest first
    pub fn recent_crossings(&self, limit: usize) -> Vec<GateCrossing> {
        self.crossings.iter().rev().take(limit).cloned().collect()
    }

    /// Entries across all gates in the trailing window, scaled to a
    /// per-minute throughput
    pub fn entry_throughput(&self, window_seconds: f64, now: f64) -> f64 {
        if window_seconds <= 0.0 {
            return 0.0;
        }
        let cutoff = now - window_seconds;
        let entries = self
            .crossings
            .iter()
            .filter(|c| c.direction == CrossingDirection::Entry && c.timestamp > cutoff)
            .count();
        entries as f64 * 60.0 / window_seconds
    }

    /// Replace a gate's counting line. Counters and crossed-sets for the
    /// gate are cleared since the old geometry no longer applies.
    pub fn set_gate_line(&mut self, gate_id: &GateId, line: (Point, Point)) -> anyhow::Result<()> {
        if line.0 == line.1 {
            bail!("gate '{gate_id}': line endpoints must be distinct");
        }
        let Some(gate) = self.gates.iter_mut().find(|g| &g.spec.id == gate_id) else {
            bail!("unknown gate '{gate_id}'");
        };
        gate.spec.line = line;
        gate.entry_count = 0;
        gate.exit_count = 0;
        gate.crossed.clear();
        self.crossings.retain(|c| &c.gate_id != gate_id);
        Ok(())
    }

    /// Reset one gate or all gates. Clears counters, crossed-sets and the
    /// crossing log for the chosen scope.
    pub fn reset(&mut self, gate_id: Option<&GateId>) -> anyhow::Result<()> {
        match gate_id {
            Some(id) => {
                let Some(gate) = self.gates.iter_mut().find(|g| &g.spec.id == id) else {
                    bail!("unknown gate '{id}'");
                };
                gate.entry_count = 0;
                gate.exit_count = 0;
                gate.crossed.clear();
                self.crossings.retain(|c| &c.gate_id != id);
            }
            None => {
                for gate in &mut self.gates {
                    gate.entry_count = 0;
                    gate.exit_count = 0;
                    gate.crossed.clear();
                }
                self.crossings.clear();
                self.trails.clear();
            }
        }
        Ok(())
    }
}

/// Classify a crossing by the sign of displacement · entry_direction.
/// Pure function of its inputs so identical movements always classify
/// identically.
fn classify_direction(prev: Point, curr: Point, entry_direction: (f64, f64)) -> CrossingDirection {
    let dot = (curr.x - prev.x) * entry_direction.0 + (curr.y - prev.y) * entry_direction.1;
    if dot > 0.0 {
        CrossingDirection::Entry
    } else {
        CrossingDirection::Exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TrackedPerson;

    fn horizontal_gate() -> Vec<GateSpec> {
        vec![GateSpec {
            id: GateId::from("main"),
            line: (Point::new(0.1, 0.6), Point::new(0.9, 0.6)),
            entry_direction: (0.0, 1.0),
        }]
    }

    fn person(id: &str, x: f64, y: f64) -> TrackedPerson {
        TrackedPerson {
            id: TrackId::from(id),
            x,
            y,
            width: 0.05,
            height: 0.1,
            confidence: 0.9,
            timestamp: 0.0,
        }
    }

    fn snapshot(persons: Vec<TrackedPerson>) -> Snapshot {
        Snapshot { persons, crowd_velocity: 1.0, timestamp: 0.0 }
    }

    #[test]
    fn test_entry_crossing_counted_once() {
        let mut counter = GateCounter::new(&horizontal_gate());

        // Above the line, then below: downward = entry
        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 1.0);
        let crossings = counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 2.0);

        assert_eq!(crossings.len(), 1);
        assert_eq!(crossings[0].direction, CrossingDirection::Entry);
        assert_eq!(crossings[0].gate_id.as_str(), "main");

        let stats = counter.gate_stats();
        assert_eq!(stats[0].entry_count, 1);
        assert_eq!(stats[0].exit_count, 0);
        assert_eq!(stats[0].net_count, 1);
    }

    #[test]
    fn test_no_double_count_on_recross() {
        let mut counter = GateCounter::new(&horizontal_gate());

        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 1.0);
        counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 2.0);
        // Walks back over the line and forward again
        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 3.0);
        counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 4.0);

        let stats = counter.gate_stats();
        assert_eq!(stats[0].total_crossings, 1);
    }

    #[test]
    fn test_exit_direction() {
        let mut counter = GateCounter::new(&horizontal_gate());

        // Below the line, then above: against entry direction = exit
        counter.update(&snapshot(vec![person("T002", 0.5, 0.65)]), 1.0);
        let crossings = counter.update(&snapshot(vec![person("T002", 0.5, 0.55)]), 2.0);

        assert_eq!(crossings.len(), 1);
        assert_eq!(crossings[0].direction, CrossingDirection::Exit);
        assert_eq!(counter.gate_stats()[0].exit_count, 1);
        assert_eq!(counter.gate_stats()[0].net_count, -1);
    }

    #[test]
    fn test_classify_direction_is_pure() {
        let prev = Point::new(0.5, 0.55);
        let curr = Point::new(0.5, 0.65);
        for _ in 0..10 {
            assert_eq!(classify_direction(prev, curr, (0.0, 1.0)), CrossingDirection::Entry);
            assert_eq!(classify_direction(curr, prev, (0.0, 1.0)), CrossingDirection::Exit);
        }
    }

    #[test]
    fn test_movement_without_intersection() {
        let mut counter = GateCounter::new(&horizontal_gate());

        counter.update(&snapshot(vec![person("T003", 0.5, 0.2)]), 1.0);
        let crossings = counter.update(&snapshot(vec![person("T003", 0.5, 0.3)]), 2.0);
        assert!(crossings.is_empty());

        // Crossing past the gate segment's horizontal extent does not count
        counter.update(&snapshot(vec![person("T004", 0.95, 0.55)]), 3.0);
        let crossings = counter.update(&snapshot(vec![person("T004", 0.95, 0.65)]), 4.0);
        assert!(crossings.is_empty());
    }

    #[test]
    fn test_flow_rate_scaled_per_minute() {
        let mut counter = GateCounter::new(&horizontal_gate());

        counter.update(&snapshot(vec![person("T001", 0.5, 0.55), person("T002", 0.4, 0.55)]), 100.0);
        counter.update(&snapshot(vec![person("T001", 0.5, 0.65), person("T002", 0.4, 0.65)]), 101.0);

        let gate_id = GateId::from("main");
        let rate = counter.flow_rate(&gate_id, 60.0, 110.0).unwrap();
        assert_eq!(rate.entry_rate, 2.0);
        assert_eq!(rate.exit_rate, 0.0);
        assert_eq!(rate.net_rate, 2.0);

        // A 30s window doubles the per-minute multiplier
        let rate = counter.flow_rate(&gate_id, 30.0, 110.0).unwrap();
        assert_eq!(rate.entry_rate, 4.0);

        // Crossings outside the window no longer contribute
        let rate = counter.flow_rate(&gate_id, 60.0, 300.0).unwrap();
        assert_eq!(rate.entry_rate, 0.0);
    }

    #[test]
    fn test_flow_rate_unknown_gate() {
        let counter = GateCounter::new(&horizontal_gate());
        let err = counter.flow_rate(&GateId::from("nope"), 60.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("unknown gate"));
    }

    #[test]
    fn test_recent_crossings_newest_first() {
        let mut counter = GateCounter::new(&horizontal_gate());

        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 1.0);
        counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 2.0);
        counter.update(&snapshot(vec![person("T002", 0.4, 0.55)]), 3.0);
        counter.update(&snapshot(vec![person("T002", 0.4, 0.65)]), 4.0);

        let recent = counter.recent_crossings(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].track_id.as_str(), "T002");
        assert_eq!(recent[1].track_id.as_str(), "T001");

        assert_eq!(counter.recent_crossings(1).len(), 1);
    }

    #[test]
    fn test_reset_single_gate_allows_recount() {
        let mut counter = GateCounter::new(&horizontal_gate());
        let gate_id = GateId::from("main");

        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 1.0);
        counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 2.0);
        assert_eq!(counter.gate_stats()[0].entry_count, 1);

        counter.reset(Some(&gate_id)).unwrap();
        assert_eq!(counter.gate_stats()[0].entry_count, 0);
        assert!(counter.recent_crossings(10).is_empty());

        // Same track can cross again after reset
        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 3.0);
        let crossings = counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 4.0);
        assert_eq!(crossings.len(), 1);
    }

    #[test]
    fn test_reset_unknown_gate_errors_without_mutation() {
        let mut counter = GateCounter::new(&horizontal_gate());
        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 1.0);
        counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 2.0);

        assert!(counter.reset(Some(&GateId::from("bogus"))).is_err());
        assert_eq!(counter.gate_stats()[0].entry_count, 1);
    }

    #[test]
    fn test_reset_idempotent_on_empty() {
        let mut counter = GateCounter::new(&horizontal_gate());
        counter.reset(None).unwrap();
        counter.reset(None).unwrap();
        assert_eq!(counter.gate_stats()[0].total_crossings, 0);
    }

    #[test]
    fn test_trail_bounded() {
        let mut counter = GateCounter::new(&horizontal_gate());
        for i in 0..100 {
            counter.update(&snapshot(vec![person("T001", 0.2, 0.2)]), i as f64 * 0.2);
        }
        let trail = counter.trails.get(&TrackId::from("T001")).unwrap();
        assert_eq!(trail.positions.len(), TRAIL_LEN);
    }

    #[test]
    fn test_stale_tracks_pruned() {
        let mut counter = GateCounter::new(&horizontal_gate());
        counter.update(&snapshot(vec![person("T001", 0.2, 0.2)]), 1.0);
        counter.update(&snapshot(vec![person("T002", 0.3, 0.3)]), 100.0);
        assert!(!counter.trails.contains_key(&TrackId::from("T001")));
        assert!(counter.trails.contains_key(&TrackId::from("T002")));
    }

    #[test]
    fn test_set_gate_line_revalidates() {
        let mut counter = GateCounter::new(&horizontal_gate());
        let gate_id = GateId::from("main");

        counter
            .set_gate_line(&gate_id, (Point::new(0.1, 0.3), Point::new(0.9, 0.3)))
            .unwrap();

        // Crossing the old line position no longer counts
        counter.update(&snapshot(vec![person("T001", 0.5, 0.55)]), 1.0);
        assert!(counter.update(&snapshot(vec![person("T001", 0.5, 0.65)]), 2.0).is_empty());

        // Crossing the new position does
        counter.update(&snapshot(vec![person("T002", 0.5, 0.25)]), 3.0);
        assert_eq!(counter.update(&snapshot(vec![person("T002", 0.5, 0.35)]), 4.0).len(), 1);

        let err =
            counter.set_gate_line(&gate_id, (Point::new(0.5, 0.5), Point::new(0.5, 0.5)));
        assert!(err.is_err());
    }
}
