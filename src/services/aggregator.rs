//! Crowd metrics aggregation
//!
//! Smooths raw per-tick measurements (people count, velocity) over short
//! buffers, derives density and congestion status from calibrated
//! threshold ladders, estimates queue wait from the service rate, and
//! keeps bounded histories for trend queries.

use crate::domain::types::CongestionStatus;
use anyhow::bail;
use serde::Serialize;
use std::collections::VecDeque;

/// Smoothing buffer length for count and velocity
const SMOOTHING_SAMPLES: usize = 10;
/// Retained history samples per metric (5 minutes at 1/sec)
const HISTORY_CAP: usize = 300;
/// Trend comparison window
const TREND_WINDOW_SECS: f64 = 300.0;
/// Edge span averaged on each side of the trend window
const TREND_EDGE_SECS: f64 = 60.0;

/// Density ladder, people per square meter
const DENSITY_FREE: f64 = 1.5;
const DENSITY_MODERATE: f64 = 2.5;
const DENSITY_CONGESTED: f64 = 3.5;

/// Velocity ladder, meters per second
const VELOCITY_FREE: f64 = 0.8;
const VELOCITY_MODERATE: f64 = 0.5;
const VELOCITY_CONGESTED: f64 = 0.3;

/// Walking speed the service rate was calibrated against
const NOMINAL_WALK_SPEED: f64 = 0.8;
/// Velocity floor for the wait-time adjustment
const WAIT_VELOCITY_FLOOR: f64 = 0.3;

/// Aggregated crowd metrics for one tick
#[derive(Debug, Clone, Serialize)]
pub struct CrowdMetrics {
    pub people_count: usize,
    /// People per square meter
    pub density: f64,
    pub congestion_status: CongestionStatus,
    /// Smoothed velocity, m/s
    pub velocity: f64,
    /// Gate throughput, people per minute
    pub flow_rate: f64,
    /// Percentage change of count over the trend window
    pub count_trend: f64,
    /// Estimated queue wait in minutes
    pub wait_time_minutes: f64,
}

/// Which history a trend query reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendMetric {
    Density,
    Count,
    Velocity,
}

/// One chart-ready trend point
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    /// HH:MM wall-clock label
    pub time: String,
    pub value: f64,
}

/// Per-session metrics aggregator
pub struct MetricsAggregator {
    zone_area_sqm: f64,
    service_rate_per_min: f64,
    people_count: usize,
    velocity: f64,
    flow_rate: f64,
    count_buffer: VecDeque<usize>,
    velocity_buffer: VecDeque<f64>,
    count_history: VecDeque<(f64, f64)>,
    velocity_history: VecDeque<(f64, f64)>,
    density_history: VecDeque<(f64, f64)>,
}

impl MetricsAggregator {
    pub fn new(zone_area_sqm: f64, service_rate_per_min: f64) -> Self {
        Self {
            zone_area_sqm,
            service_rate_per_min,
            people_count: 0,
            velocity: 0.0,
            flow_rate: 0.0,
            count_buffer: VecDeque::with_capacity(SMOOTHING_SAMPLES),
            velocity_buffer: VecDeque::with_capacity(SMOOTHING_SAMPLES),
            count_history: VecDeque::with_capacity(HISTORY_CAP),
            velocity_history: VecDeque::with_capacity(HISTORY_CAP),
            density_history: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    /// Fold one tick of raw measurements into the smoothed state
    pub fn update(&mut self, people_count: usize, velocity: f64, flow_rate: f64, now: f64) {
        push_bounded(&mut self.count_buffer, people_count, SMOOTHING_SAMPLES);
        push_bounded(&mut self.velocity_buffer, velocity, SMOOTHING_SAMPLES);

        self.people_count = (self.count_buffer.iter().sum::<usize>() as f64
            / self.count_buffer.len() as f64) as usize;
        self.velocity =
            self.velocity_buffer.iter().sum::<f64>() / self.velocity_buffer.len() as f64;
        self.flow_rate = flow_rate;

        let density = self.density();
        push_bounded(&mut self.count_history, (now, self.people_count as f64), HISTORY_CAP);
        push_bounded(&mut self.velocity_history, (now, self.velocity), HISTORY_CAP);
        push_bounded(&mut self.density_history, (now, density), HISTORY_CAP);
    }

    /// Crowd density in people per square meter
    pub fn density(&self) -> f64 {
        if self.zone_area_sqm <= 0.0 {
            return 0.0;
        }
        self.people_count as f64 / self.zone_area_sqm
    }

    /// Congestion state from the density and velocity ladders. Either
    /// signal alone can escalate the status.
    pub fn congestion_status(&self) -> CongestionStatus {
        let density = self.density();
        let velocity = self.velocity;

        if density >= DENSITY_CONGESTED || velocity <= VELOCITY_CONGESTED {
            CongestionStatus::Severe
        } else if density >= DENSITY_MODERATE || velocity <= VELOCITY_MODERATE {
            CongestionStatus::Congested
        } else if density >= DENSITY_FREE || velocity <= VELOCITY_FREE {
            CongestionStatus::Moderate
        } else {
            CongestionStatus::Free
        }
    }

    /// Percentage change between the oldest and newest minute of the
    /// trend window
    pub fn count_trend(&self, now: f64) -> f64 {
        if self.count_history.len() < 2 {
            return 0.0;
        }

        let window_start = now - TREND_WINDOW_SECS;
        let old: Vec<f64> = self
            .count_history
            .iter()
            .filter(|(t, _)| *t < window_start + TREND_EDGE_SECS)
            .map(|(_, v)| *v)
            .collect();
        let new: Vec<f64> = self
            .count_history
            .iter()
            .filter(|(t, _)| *t > now - TREND_EDGE_SECS)
            .map(|(_, v)| *v)
            .collect();

        if old.is_empty() || new.is_empty() {
            return 0.0;
        }

        let old_avg = old.iter().sum::<f64>() / old.len() as f64;
        let new_avg = new.iter().sum::<f64>() / new.len() as f64;
        if old_avg == 0.0 {
            return 0.0;
        }
        (new_avg - old_avg) / old_avg * 100.0
    }

    /// Estimated wait in minutes: smoothed queue length over the
    /// velocity-adjusted service rate. Slower movement stretches the
    /// wait; the floor keeps a stalled queue estimate finite.
    pub fn wait_time_minutes(&self) -> f64 {
        let velocity_factor = self.velocity.max(WAIT_VELOCITY_FLOOR) / NOMINAL_WALK_SPEED;
        let effective_rate = self.service_rate_per_min * velocity_factor;
        if effective_rate <= 0.0 {
            return 0.0;
        }
        self.people_count as f64 / effective_rate
    }

    /// All current metrics as one snapshot
    pub fn metrics(&self, now: f64) -> CrowdMetrics {
        CrowdMetrics {
            people_count: self.people_count,
            density: self.density(),
            congestion_status: self.congestion_status(),
            velocity: self.velocity,
            flow_rate: self.flow_rate,
            count_trend: self.count_trend(now),
            wait_time_minutes: self.wait_time_minutes(),
        }
    }

    /// Evenly sampled history points for charts, newest last
    pub fn trend_data(&self, metric: TrendMetric, points: usize) -> Vec<TrendPoint> {
        let history = match metric {
            TrendMetric::Density => &self.density_history,
            TrendMetric::Count => &self.count_history,
            TrendMetric::Velocity => &self.velocity_history,
        };
        if history.is_empty() || points == 0 {
            return Vec::new();
        }

        let step = (history.len() / points).max(1);
        let sampled: Vec<&(f64, f64)> = history.iter().step_by(step).collect();
        sampled
            .into_iter()
            .rev()
            .take(points)
            .rev()
            .map(|&(t, v)| TrendPoint { time: format_clock(t), value: v })
            .collect()
    }

    /// Update the monitored zone area
    pub fn set_zone_area(&mut self, area_sqm: f64) -> anyhow::Result<()> {
        if !area_sqm.is_finite() || area_sqm <= 0.0 {
            bail!("zone area must be a positive finite number, got {area_sqm}");
        }
        self.zone_area_sqm = area_sqm;
        Ok(())
    }

    /// Update the queue service rate
    pub fn set_service_rate(&mut self, rate_per_min: f64) -> anyhow::Result<()> {
        if !rate_per_min.is_finite() || rate_per_min <= 0.0 {
            bail!("service rate must be a positive finite number, got {rate_per_min}");
        }
        self.service_rate_per_min = rate_per_min;
        Ok(())
    }

    /// Clear all aggregated state, keeping configuration
    pub fn reset(&mut self) {
        self.people_count = 0;
        self.velocity = 0.0;
        self.flow_rate = 0.0;
        self.count_buffer.clear();
        self.velocity_buffer.clear();
        self.count_history.clear();
        self.velocity_history.clear();
        self.density_history.clear();
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T, cap: usize) {
    buffer.push_back(value);
    if buffer.len() > cap {
        buffer.pop_front();
    }
}

/// HH:MM label for an epoch-seconds timestamp (UTC)
fn format_clock(epoch_secs: f64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs as i64, 0)
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_default()
}
