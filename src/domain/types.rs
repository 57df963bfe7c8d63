//! Shared types for the crowd analytics engine

use crate::domain::geometry::Point;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Get current epoch seconds as float (analyzer time base)
#[inline]
pub fn epoch_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Newtype wrapper for tracker-assigned person identities
    TrackId
);
string_id!(
    /// Newtype wrapper for virtual gate identifiers
    GateId
);
string_id!(
    /// Newtype wrapper for dwell zone identifiers
    ZoneId
);
string_id!(
    /// Newtype wrapper for monitored video feed identifiers
    VideoId
);

/// One tracked person as reported by the upstream tracker for one tick.
///
/// Missing fields in the upstream payload default to zero rather than
/// failing the tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackedPerson {
    #[serde(default)]
    pub id: TrackId,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub timestamp: f64,
}

impl TrackedPerson {
    /// Center position with percentage coordinates folded down to [0, 1].
    ///
    /// Upstream trackers report either unit or percentage coordinates;
    /// anything above 1 is treated as a percentage. Box dimensions keep
    /// their native units.
    pub fn position(&self) -> Point {
        let (mut x, mut y) = (self.x, self.y);
        if x > 1.0 || y > 1.0 {
            x /= 100.0;
            y /= 100.0;
        }
        Point::new(x, y)
    }
}

/// One tick of upstream perception output: everyone currently tracked
/// plus the scene-wide velocity estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub persons: Vec<TrackedPerson>,
    /// Average crowd velocity in m/s from the optical-flow estimator
    #[serde(default)]
    pub crowd_velocity: f64,
    /// Capture time, epoch seconds. Zero means "stamp on receipt".
    #[serde(default)]
    pub timestamp: f64,
}

impl Snapshot {
    /// Capture time, substituting the wall clock when the source did not
    /// stamp the snapshot
    pub fn time(&self) -> f64 {
        if self.timestamp > 0.0 {
            self.timestamp
        } else {
            epoch_secs()
        }
    }
}

/// Severity tiers for counter-flow events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterFlowSeverity {
    Mild,
    Moderate,
    Severe,
}

impl CounterFlowSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterFlowSeverity::Mild => "mild",
            CounterFlowSeverity::Moderate => "moderate",
            CounterFlowSeverity::Severe => "severe",
        }
    }
}

/// Behavioral anomaly categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Fall,
    SuddenStop,
    StationaryPerson,
    CrowdSurge,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Fall => "fall",
            AnomalyType::SuddenStop => "sudden_stop",
            AnomalyType::StationaryPerson => "stationary_person",
            AnomalyType::CrowdSurge => "crowd_surge",
        }
    }
}

/// Anomaly severity tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Low => "low",
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
            AnomalySeverity::Critical => "critical",
        }
    }
}

/// Alert categories raised by threshold evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighDensity,
    CriticalDensity,
    LowVelocity,
    Congestion,
    LongQueue,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighDensity => "high_density",
            AlertType::CriticalDensity => "critical_density",
            AlertType::LowVelocity => "low_velocity",
            AlertType::Congestion => "congestion",
            AlertType::LongQueue => "long_queue",
        }
    }
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

/// Congestion state derived from density and velocity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionStatus {
    Free,
    Moderate,
    Congested,
    Severe,
}

impl CongestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionStatus::Free => "free",
            CongestionStatus::Moderate => "moderate",
            CongestionStatus::Congested => "congested",
            CongestionStatus::Severe => "severe",
        }
    }

    /// Congested and severe states both count toward the sustained
    /// congestion timer
    pub fn is_congested(&self) -> bool {
        matches!(self, CongestionStatus::Congested | CongestionStatus::Severe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_normalization() {
        let unit = TrackedPerson { x: 0.4, y: 0.8, ..Default::default() };
        let pos = unit.position();
        assert_eq!((pos.x, pos.y), (0.4, 0.8));

        let percent = TrackedPerson { x: 40.0, y: 80.0, ..Default::default() };
        let pos = percent.position();
        assert!((pos.x - 0.4).abs() < 1e-9);
        assert!((pos.y - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_person_defaults() {
        let person: TrackedPerson = serde_json::from_str(r#"{"id": "T001"}"#).unwrap();
        assert_eq!(person.id.as_str(), "T001");
        assert_eq!(person.x, 0.0);
        assert_eq!(person.height, 0.0);

        let empty: TrackedPerson = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.id.as_str(), "");
        assert_eq!(empty.position(), Point::new(0.0, 0.0));
    }

    #[test]
    fn test_snapshot_time_fallback() {
        let stamped = Snapshot { timestamp: 1_700_000_000.5, ..Default::default() };
        assert_eq!(stamped.time(), 1_700_000_000.5);

        let unstamped = Snapshot::default();
        assert!(unstamped.time() > 1_700_000_000.0);
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(AnomalyType::SuddenStop.as_str(), "sudden_stop");
        assert_eq!(AlertType::CriticalDensity.as_str(), "critical_density");
        assert_eq!(serde_json::to_string(&CongestionStatus::Severe).unwrap(), "\"severe\"");
        assert_eq!(serde_json::to_string(&CounterFlowSeverity::Moderate).unwrap(), "\"moderate\"");
        assert_eq!(serde_json::to_string(&AnomalyType::SuddenStop).unwrap(), "\"sudden_stop\"");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AnomalySeverity::Critical > AnomalySeverity::High);
        assert!(AnomalySeverity::Medium > AnomalySeverity::Low);
    }
}
