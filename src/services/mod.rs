//! Analyzers, aggregation, alerting, and the session engine

pub mod aggregator;
pub mod alerts;
pub mod anomaly;
pub mod dwell;
pub mod flow;
pub mod gates;
pub mod session;

pub use aggregator::MetricsAggregator;
pub use alerts::AlertManager;
pub use anomaly::AnomalyDetector;
pub use dwell::DwellTracker;
pub use flow::FlowAnalyzer;
pub use gates::GateCounter;
pub use session::{SessionRegistry, TickOutput};
