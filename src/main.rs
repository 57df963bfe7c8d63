//! Drishti - real-time crowd safety analytics
//!
//! Turns tracked-person streams from a perception pipeline into
//! operational crowd intelligence: gate counts, flow and counter-flow,
//! dwell statistics, behavioral anomalies, and threshold alerts.
//!
//! Module structure:
//! - `domain/` - Core types and geometry (TrackedPerson, gates, zones)
//! - `io/` - External interfaces (snapshot sources, subscriber fan-out)
//! - `services/` - Analyzers, aggregation, alerts, session engine
//! - `infra/` - Infrastructure (Config, runtime metrics)

use clap::Parser;
use drishti::domain::types::VideoId;
use drishti::infra::Config;
use drishti::io::SyntheticProvider;
use drishti::services::session::{SessionEvent, SessionRegistry};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Drishti - crowd safety analytics engine
#[derive(Parser, Debug)]
#[command(name = "drishti", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Video feed to monitor in demo mode
    #[arg(long, default_value = "courtyard")]
    video: String,

    /// Number of synthetic walkers in the demo feed
    #[arg(long, default_value_t = 24)]
    walkers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full per-tick visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "drishti starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        gates = config.gates().len(),
        zones = config.zones().len(),
        tick_interval_ms = %config.tick_interval_ms(),
        zone_area_sqm = %config.zone_area_sqm(),
        "config_loaded"
    );

    // Demo feed: the real deployment points the provider at the
    // perception pipeline's output instead
    let provider = Arc::new(SyntheticProvider {
        walkers: args.walkers,
        frame_interval: config.tick_interval_ms() as f64 / 1000.0,
    });
    let registry = Arc::new(SessionRegistry::new(config.clone(), provider));

    registry.register_alert_callback(Box::new(|alert| {
        info!(
            alert_id = %alert.id,
            alert_type = alert.alert_type.as_str(),
            level = alert.level.as_str(),
            zone = %alert.zone,
            message = %alert.message,
            "alert_notification"
        );
        Ok(())
    }));

    // Periodic runtime metrics report
    let report_metrics = registry.metrics();
    let report_interval = config.report_interval_secs();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(report_interval.max(1)));
        loop {
            interval.tick().await;
            report_metrics.report().log();
        }
    });

    // Console consumer: the transport layer attaches here in production
    let video = VideoId::from(args.video.as_str());
    let (subscriber_id, mut rx) = registry.subscribe(&video)?;
    info!(video_id = %video, "demo_subscriber_attached");

    let consumer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Tick(output) => {
                    // One status line every ~5 seconds at the default cadence
                    if output.tick % 25 == 0 {
                        info!(
                            video_id = %output.video_id,
                            tick = %output.tick,
                            people = %output.people_count,
                            density = format!("{:.2}", output.metrics.density),
                            congestion = output.metrics.congestion_status.as_str(),
                            crossings = output.gate_stats.iter().map(|g| g.total_crossings).sum::<u64>(),
                            counter_flow = %output.counter_flow.total_events,
                            anomalies = %output.new_anomalies.len(),
                            "tick"
                        );
                    }
                }
                SessionEvent::Error { message } => {
                    error!(error = %message, "session_stream_ended");
                    break;
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");

    registry.unsubscribe(&video, subscriber_id);
    registry.shutdown();
    let _ = consumer.await;

    info!("drishti shutdown complete");
    Ok(())
}
