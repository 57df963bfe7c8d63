//! Upstream perception source contract
//!
//! The perception pipeline (decode, detect, track, velocity) lives
//! outside this crate; sessions consume it through `SnapshotSource`.
//! `ScriptedSource` replays a fixed snapshot sequence for tests, and
//! `SyntheticSource` generates an endless walking crowd for the demo
//! binary.

use crate::domain::types::{Snapshot, TrackId, TrackedPerson, VideoId};
use async_trait::async_trait;
use std::collections::VecDeque;

/// One upstream feed of tracked-person snapshots.
///
/// `Ok(None)` means the source is exhausted; errors are terminal for the
/// consuming session. Retry policy belongs to the upstream collaborator,
/// not to this crate.
#[async_trait]
pub trait SnapshotSource: Send {
    async fn next_snapshot(&mut self) -> anyhow::Result<Option<Snapshot>>;
}

/// Opens a snapshot source for a video feed
pub trait SourceProvider: Send + Sync {
    fn open(&self, video_id: &VideoId) -> anyhow::Result<Box<dyn SnapshotSource>>;
}

/// Replays a prepared snapshot sequence, then reports exhaustion
pub struct ScriptedSource {
    frames: VecDeque<Snapshot>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Snapshot>) -> Self {
        Self { frames: frames.into() }
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn next_snapshot(&mut self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.frames.pop_front())
    }
}

/// Deterministic endless crowd for demos: walkers loop down the frame
/// and across the default gates and zones
pub struct SyntheticSource {
    walkers: usize,
    tick: u64,
    /// Simulated seconds between frames
    frame_interval: f64,
    start_time: f64,
}

impl SyntheticSource {
    pub fn new(walkers: usize, frame_interval: f64, start_time: f64) -> Self {
        Self { walkers, tick: 0, frame_interval, start_time }
    }
}

#[async_trait]
impl SnapshotSource for SyntheticSource {
    async fn next_snapshot(&mut self) -> anyhow::Result<Option<Snapshot>> {
        let t = self.tick as f64;
        let timestamp = self.start_time + t * self.frame_interval;

        let persons = (0..self.walkers)
            .map(|i| {
                let phase = i as f64 / self.walkers as f64;
                // Each walker descends the frame at its own offset and
                // wraps back to the top
                let y = (phase + t * 0.005) % 1.0;
                let x = 0.15 + 0.7 * ((phase * 7.0 + t * 0.001) % 1.0);
                TrackedPerson {
                    id: TrackId::from(format!("W{i:03}").as_str()),
                    x,
                    y,
                    width: 12.0,
                    height: 24.0,
                    confidence: 0.9,
                    timestamp,
                }
            })
            .collect();

        self.tick += 1;
        Ok(Some(Snapshot {
            persons,
            // Gentle oscillation around normal walking pace
            crowd_velocity: 0.9 + 0.3 * (t * 0.01).sin(),
            timestamp,
        }))
    }
}

/// Hands every session a fresh synthetic crowd
pub struct SyntheticProvider {
    pub walkers: usize,
    pub frame_interval: f64,
}

impl SourceProvider for SyntheticProvider {
    fn open(&self, _video_id: &VideoId) -> anyhow::Result<Box<dyn SnapshotSource>> {
        Ok(Box::new(SyntheticSource::new(
            self.walkers,
            self.frame_interval,
            crate::domain::types::epoch_secs(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_replays_then_ends() {
        let frames = vec![
            Snapshot { timestamp: 1.0, ..Default::default() },
            Snapshot { timestamp: 2.0, ..Default::default() },
        ];
        let mut source = ScriptedSource::new(frames);

        assert_eq!(source.next_snapshot().await.unwrap().unwrap().timestamp, 1.0);
        assert_eq!(source.next_snapshot().await.unwrap().unwrap().timestamp, 2.0);
        assert!(source.next_snapshot().await.unwrap().is_none());
        assert!(source.next_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_synthetic_source_is_endless_and_monotonic() {
        let mut source = SyntheticSource::new(8, 0.2, 1000.0);

        let first = source.next_snapshot().await.unwrap().unwrap();
        let second = source.next_snapshot().await.unwrap().unwrap();

        assert_eq!(first.persons.len(), 8);
        assert!(second.timestamp > first.timestamp);
        // Same walker keeps its identity across frames
        assert_eq!(first.persons[0].id, second.persons[0].id);
        // Walkers drift downward between frames
        assert!(second.persons[0].y > first.persons[0].y);
    }
}
