//! Core domain types and geometry

pub mod geometry;
pub mod types;

pub use geometry::Point;
pub use types::{
    AlertLevel, AlertType, AnomalySeverity, AnomalyType, CongestionStatus, CounterFlowSeverity,
    GateId, Snapshot, TrackId, TrackedPerson, VideoId, ZoneId,
};
