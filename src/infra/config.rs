//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::geometry::Point;
use crate::domain::types::{GateId, ZoneId};
use anyhow::{bail, Context};
use serde::Deserialize;
use smallvec::SmallVec;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "tirumala-east")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "drishti".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Minimum inter-tick pacing interval
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upstream snapshot read timeout
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Per-subscriber channel depth
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_tick_interval_ms() -> u64 {
    200 // 5 ticks/sec, matching the perception pipeline cadence
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_subscriber_buffer() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlGate {
    pub id: String,
    /// Line endpoints as [[x1, y1], [x2, y2]] in normalized coordinates
    pub line: [[f64; 2]; 2],
    /// Which side of the line counts as entry, as a direction vector
    pub entry_direction: [f64; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlZone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Ordered vertex list, normalized coordinates
    pub polygon: Vec<[f64; 2]>,
    #[serde(default = "default_expected_dwell")]
    pub expected_dwell_secs: f64,
}

fn default_expected_dwell() -> f64 {
    60.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Minimum angular deviation from dominant flow to flag counter-flow
    #[serde(default = "default_counter_flow_angle")]
    pub counter_flow_angle: f64,
}

fn default_counter_flow_angle() -> f64 {
    120.0
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self { counter_flow_angle: default_counter_flow_angle() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Monitored zone area for density calculation
    #[serde(default = "default_zone_area_sqm")]
    pub zone_area_sqm: f64,
    /// Queue service rate, people per minute
    #[serde(default = "default_service_rate")]
    pub service_rate_per_min: f64,
    /// Ops metrics report interval
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_zone_area_sqm() -> f64 {
    100.0
}

fn default_service_rate() -> f64 {
    2.0
}

fn default_report_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            zone_area_sqm: default_zone_area_sqm(),
            service_rate_per_min: default_service_rate(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

/// Alert threshold ladder, people/m² and m/s calibrated for the
/// deployed camera geometry
#[derive(Debug, Clone, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_density_warning")]
    pub density_warning: f64,
    #[serde(default = "default_density_critical")]
    pub density_critical: f64,
    #[serde(default = "default_velocity_warning")]
    pub velocity_warning: f64,
    #[serde(default = "default_velocity_critical")]
    pub velocity_critical: f64,
    #[serde(default = "default_queue_long")]
    pub queue_long_minutes: f64,
    #[serde(default = "default_queue_very_long")]
    pub queue_very_long_minutes: f64,
    #[serde(default = "default_congestion_duration")]
    pub congestion_duration_secs: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: f64,
}

fn default_density_warning() -> f64 {
    2.5
}
fn default_density_critical() -> f64 {
    3.5
}
fn default_velocity_warning() -> f64 {
    0.5
}
fn default_velocity_critical() -> f64 {
    0.3
}
fn default_queue_long() -> f64 {
    45.0
}
fn default_queue_very_long() -> f64 {
    60.0
}
fn default_congestion_duration() -> f64 {
    120.0
}
fn default_cooldown() -> f64 {
    60.0
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            density_warning: default_density_warning(),
            density_critical: default_density_critical(),
            velocity_warning: default_velocity_warning(),
            velocity_critical: default_velocity_critical(),
            queue_long_minutes: default_queue_long(),
            queue_very_long_minutes: default_queue_very_long(),
            congestion_duration_secs: default_congestion_duration(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl AlertThresholds {
    /// Update a threshold by key. Unknown keys and non-positive values
    /// are rejected without mutating anything.
    pub fn set(&mut self, key: &str, value: f64) -> anyhow::Result<()> {
        if !value.is_finite() || value <= 0.0 {
            bail!("threshold '{key}' must be a positive finite number, got {value}");
        }
        match key {
            "density_warning" => self.density_warning = value,
            "density_critical" => self.density_critical = value,
            "velocity_warning" => self.velocity_warning = value,
            "velocity_critical" => self.velocity_critical = value,
            "queue_long_minutes" => self.queue_long_minutes = value,
            "queue_very_long_minutes" => self.queue_very_long_minutes = value,
            "congestion_duration_secs" => self.congestion_duration_secs = value,
            "cooldown_secs" => self.cooldown_secs = value,
            other => bail!("unknown alert threshold '{other}'"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub gates: Vec<TomlGate>,
    #[serde(default)]
    pub zones: Vec<TomlZone>,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub alerts: AlertThresholds,
}

/// A validated virtual counting line
#[derive(Debug, Clone)]
pub struct GateSpec {
    pub id: GateId,
    pub line: (Point, Point),
    /// Unit vector pointing toward the entry side
    pub entry_direction: (f64, f64),
}

impl GateSpec {
    pub fn new(id: &str, line: (Point, Point), entry_direction: (f64, f64)) -> anyhow::Result<Self> {
        if line.0 == line.1 {
            bail!("gate '{id}': line endpoints must be distinct");
        }
        let (dx, dy) = entry_direction;
        let mag = (dx * dx + dy * dy).sqrt();
        if mag == 0.0 || !mag.is_finite() {
            bail!("gate '{id}': entry_direction must be a non-zero vector");
        }
        Ok(Self { id: GateId::from(id), line, entry_direction: (dx / mag, dy / mag) })
    }
}

/// A validated dwell zone polygon
#[derive(Debug, Clone)]
pub struct ZoneSpec {
    pub id: ZoneId,
    pub name: String,
    pub polygon: SmallVec<[Point; 8]>,
    pub expected_dwell_secs: f64,
}

impl ZoneSpec {
    pub fn new(
        id: &str,
        name: &str,
        polygon: &[Point],
        expected_dwell_secs: f64,
    ) -> anyhow::Result<Self> {
        if polygon.len() < 3 {
            bail!("zone '{id}': polygon needs at least 3 vertices, got {}", polygon.len());
        }
        if expected_dwell_secs <= 0.0 {
            bail!("zone '{id}': expected_dwell_secs must be positive, got {expected_dwell_secs}");
        }
        Ok(Self {
            id: ZoneId::from(id),
            name: if name.is_empty() { id.to_string() } else { name.to_string() },
            polygon: polygon.iter().copied().collect(),
            expected_dwell_secs,
        })
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    tick_interval_ms: u64,
    read_timeout_ms: u64,
    subscriber_buffer: usize,
    gates: Vec<GateSpec>,
    zones: Vec<ZoneSpec>,
    counter_flow_angle: f64,
    zone_area_sqm: f64,
    service_rate_per_min: f64,
    report_interval_secs: u64,
    thresholds: AlertThresholds,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            tick_interval_ms: default_tick_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            subscriber_buffer: default_subscriber_buffer(),
            gates: Self::default_gates(),
            zones: Self::default_zones(),
            counter_flow_angle: default_counter_flow_angle(),
            zone_area_sqm: default_zone_area_sqm(),
            service_rate_per_min: default_service_rate(),
            report_interval_secs: default_report_interval_secs(),
            thresholds: AlertThresholds::default(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Counting lines matching the temple courtyard camera layout
    fn default_gates() -> Vec<GateSpec> {
        vec![
            GateSpec {
                id: GateId::from("main_entrance"),
                line: (Point::new(0.1, 0.6), Point::new(0.9, 0.6)),
                entry_direction: (0.0, 1.0), // downward movement is entry
            },
            GateSpec {
                id: GateId::from("inner_gate"),
                line: (Point::new(0.2, 0.4), Point::new(0.8, 0.4)),
                entry_direction: (0.0, 1.0),
            },
        ]
    }

    fn default_zones() -> Vec<ZoneSpec> {
        vec![
            ZoneSpec {
                id: ZoneId::from("darshan_zone"),
                name: "Darshan Area".to_string(),
                polygon: SmallVec::from_slice(&[
                    Point::new(0.3, 0.2),
                    Point::new(0.7, 0.2),
                    Point::new(0.7, 0.5),
                    Point::new(0.3, 0.5),
                ]),
                expected_dwell_secs: 30.0,
            },
            ZoneSpec {
                id: ZoneId::from("queue_area"),
                name: "Queue Area".to_string(),
                polygon: SmallVec::from_slice(&[
                    Point::new(0.1, 0.5),
                    Point::new(0.9, 0.5),
                    Point::new(0.9, 0.9),
                    Point::new(0.1, 0.9),
                ]),
                expected_dwell_secs: 300.0, // 5 minute expected wait
            },
            ZoneSpec {
                id: ZoneId::from("entry_zone"),
                name: "Entry Area".to_string(),
                polygon: SmallVec::from_slice(&[
                    Point::new(0.0, 0.8),
                    Point::new(0.3, 0.8),
                    Point::new(0.3, 1.0),
                    Point::new(0.0, 1.0),
                ]),
                expected_dwell_secs: 15.0,
            },
        ]
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, &path.display().to_string())
    }

    fn from_toml(toml_config: TomlConfig, config_file: &str) -> anyhow::Result<Self> {
        let mut gates = Vec::with_capacity(toml_config.gates.len());
        for g in &toml_config.gates {
            gates.push(GateSpec::new(
                &g.id,
                (
                    Point::new(g.line[0][0], g.line[0][1]),
                    Point::new(g.line[1][0], g.line[1][1]),
                ),
                (g.entry_direction[0], g.entry_direction[1]),
            )?);
        }
        if gates.is_empty() {
            gates = Self::default_gates();
        }

        let mut zones = Vec::with_capacity(toml_config.zones.len());
        for z in &toml_config.zones {
            let polygon: Vec<Point> =
                z.polygon.iter().map(|p| Point::new(p[0], p[1])).collect();
            zones.push(ZoneSpec::new(&z.id, &z.name, &polygon, z.expected_dwell_secs)?);
        }
        if zones.is_empty() {
            zones = Self::default_zones();
        }

        let flow_angle = toml_config.flow.counter_flow_angle;
        if !(0.0..=180.0).contains(&flow_angle) {
            bail!("flow.counter_flow_angle must be within [0, 180], got {flow_angle}");
        }
        if toml_config.metrics.zone_area_sqm <= 0.0 {
            bail!(
                "metrics.zone_area_sqm must be positive, got {}",
                toml_config.metrics.zone_area_sqm
            );
        }
        if toml_config.metrics.service_rate_per_min <= 0.0 {
            bail!(
                "metrics.service_rate_per_min must be positive, got {}",
                toml_config.metrics.service_rate_per_min
            );
        }

        Ok(Self {
            site_id: toml_config.site.id,
            tick_interval_ms: toml_config.session.tick_interval_ms,
            read_timeout_ms: toml_config.session.read_timeout_ms,
            subscriber_buffer: toml_config.session.subscriber_buffer.max(1),
            gates,
            zones,
            counter_flow_angle: flow_angle,
            zone_area_sqm: toml_config.metrics.zone_area_sqm,
            service_rate_per_min: toml_config.metrics.service_rate_per_min,
            report_interval_secs: toml_config.metrics.report_interval_secs,
            thresholds: toml_config.alerts,
            config_file: config_file.to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {e:#}. Using defaults.");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }

    pub fn gates(&self) -> &[GateSpec] {
        &self.gates
    }

    pub fn zones(&self) -> &[ZoneSpec] {
        &self.zones
    }

    pub fn counter_flow_angle(&self) -> f64 {
        self.counter_flow_angle
    }

    pub fn zone_area_sqm(&self) -> f64 {
        self.zone_area_sqm
    }

    pub fn service_rate_per_min(&self) -> f64 {
        self.service_rate_per_min
    }

    pub fn report_interval_secs(&self) -> u64 {
        self.report_interval_secs
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to tighten session pacing
    #[cfg(test)]
    pub fn with_session_tuning(
        mut self,
        tick_interval_ms: u64,
        read_timeout_ms: u64,
        subscriber_buffer: usize,
    ) -> Self {
        self.tick_interval_ms = tick_interval_ms;
        self.read_timeout_ms = read_timeout_ms;
        self.subscriber_buffer = subscriber_buffer;
        self
    }

    /// Builder method for tests to replace the gate set
    #[cfg(test)]
    pub fn with_gates(mut self, gates: Vec<GateSpec>) -> Self {
        self.gates = gates;
        self
    }

    /// Builder method for tests to replace the zone set
    #[cfg(test)]
    pub fn with_zones(mut self, zones: Vec<ZoneSpec>) -> Self {
        self.zones = zones;
        self
    }

    /// Builder method for tests to shrink the monitored area
    #[cfg(test)]
    pub fn with_zone_area_sqm(mut self, area: f64) -> Self {
        self.zone_area_sqm = area;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "drishti");
        assert_eq!(config.tick_interval_ms(), 200);
        assert_eq!(config.gates().len(), 2);
        assert_eq!(config.zones().len(), 3);
        assert_eq!(config.counter_flow_angle(), 120.0);
        assert_eq!(config.thresholds().density_critical, 3.5);
        assert_eq!(config.thresholds().cooldown_secs, 60.0);
    }

    #[test]
    fn test_default_gate_geometry() {
        let config = Config::default();
        let main = &config.gates()[0];
        assert_eq!(main.id.as_str(), "main_entrance");
        assert_eq!(main.line.0, Point::new(0.1, 0.6));
        assert_eq!(main.entry_direction, (0.0, 1.0));
    }

    #[test]
    fn test_gate_spec_rejects_degenerate_line() {
        let err = GateSpec::new(
            "bad",
            (Point::new(0.5, 0.5), Point::new(0.5, 0.5)),
            (0.0, 1.0),
        )
        .unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn test_gate_spec_rejects_zero_direction() {
        let err = GateSpec::new(
            "bad",
            (Point::new(0.0, 0.5), Point::new(1.0, 0.5)),
            (0.0, 0.0),
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn test_gate_spec_normalizes_direction() {
        let gate = GateSpec::new(
            "g",
            (Point::new(0.0, 0.5), Point::new(1.0, 0.5)),
            (0.0, 2.0),
        )
        .unwrap();
        assert_eq!(gate.entry_direction, (0.0, 1.0));
    }

    #[test]
    fn test_zone_spec_rejects_thin_polygon() {
        let err = ZoneSpec::new(
            "bad",
            "Bad",
            &[Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
            60.0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least 3"));
    }

    #[test]
    fn test_threshold_set_validation() {
        let mut thresholds = AlertThresholds::default();
        thresholds.set("density_warning", 3.0).unwrap();
        assert_eq!(thresholds.density_warning, 3.0);

        assert!(thresholds.set("density_warning", -1.0).is_err());
        assert!(thresholds.set("density_warning", f64::NAN).is_err());
        assert!(thresholds.set("no_such_key", 1.0).is_err());
        // Rejected updates leave the previous value intact
        assert_eq!(thresholds.density_warning, 3.0);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["drishti".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "drishti".to_string(),
            "--config".to_string(),
            "config/tirumala.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/tirumala.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["drishti".to_string(), "--config=config/festival.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/festival.toml");
    }
}
