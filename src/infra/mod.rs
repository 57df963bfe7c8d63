//! Infrastructure: configuration and runtime metrics

pub mod config;
pub mod metrics;

pub use config::{AlertThresholds, Config, GateSpec, ZoneSpec};
pub use metrics::{Metrics, MetricsSummary};
