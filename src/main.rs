//! Dock scanner - reads shipment labels as objects reach the dock
//!
//! Flow: the proximity gate waits for an object, then an acquisition session
//! pulls frames and decodes symbols until every manifest code has been seen.
//!
//! Module structure:
//! - `domain/` - Core types (readings, regions, events, manifest)
//! - `io/` - External interfaces (ranging, frames, symbol reader, egress)
//! - `services/` - Gate, acquisition session, decoder, matcher
//! - `infra/` - Infrastructure (Config, Metrics, cancellation)

use anyhow::Context;
use clap::Parser;
use dock_scanner::domain::{GateEvent, SessionEvent, ShipmentManifest};
use dock_scanner::infra::{cancel_pair, CancelToken, Config, Metrics};
use dock_scanner::io::{
    Egress, FrameSource, ImageDirSource, PulseSensor, ScriptedPulses, SerialRanging, WholeFrameProposer,
    ZbarCommandReader,
};
use dock_scanner::services::{
    AcquisitionSession, GateOutcome, ProximityGate, SessionOutcome, SymbolDecoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Dock scanner - proximity-triggered label acquisition
#[derive(Parser, Debug)]
#[command(name = "dock-scanner", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Shipment manifest, one code per line
    #[arg(short, long)]
    manifest: String,

    /// Replace the ultrasonic sensors with a constant distance (inches)
    #[arg(long)]
    simulate: Option<f64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-read and per-frame events
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "dock-scanner starting");

    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        sensors = %config.sensors().len(),
        trigger_distance_in = %config.trigger_distance_in(),
        policy = %config.trigger_policy().as_str(),
        cadence_ms = %config.cadence_ms(),
        variant_level = %config.variant_level(),
        frames_dir = %config.frames_dir(),
        egress_file = %config.egress_file(),
        simulate = ?args.simulate,
        "config_loaded"
    );

    // Everything is built and validated before any loop starts
    let manifest = ShipmentManifest::from_file(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest))?;
    info!(codes = %manifest.len(), "manifest_loaded");

    let gate_settings = config.gate_settings().context("Invalid gate configuration")?;
    let session_settings = config.session_settings().context("Invalid acquisition configuration")?;
    let decoder_settings = config.decoder_settings().context("Invalid decoder configuration")?;

    let reader = ZbarCommandReader::new(config.zbarimg())
        .with_timeout(Duration::from_millis(config.reader_timeout_ms()));
    reader.probe().context("Symbol reader unavailable")?;

    let decoder = Arc::new(SymbolDecoder::new(decoder_settings, Arc::new(reader))?);
    let frames = ImageDirSource::open(config.frames_dir(), config.frames_repeat())
        .context("Frame source unavailable")?;

    let metrics = Arc::new(Metrics::new());
    let session = AcquisitionSession::new(
        &manifest,
        frames,
        Arc::new(WholeFrameProposer),
        decoder,
        session_settings,
        metrics.clone(),
    )?;
    let session_id = session.id().to_string();
    let egress = Egress::new(config.egress_file(), config.site_id());

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let (shutdown, shutdown_token) = cancel_pair();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        shutdown.cancel();
    });

    let gate_outcome = match args.simulate {
        Some(inches) => {
            let hardware = ScriptedPulses::constant(&gate_settings.sensors, inches, gate_settings.us_per_inch);
            let gate = ProximityGate::new(gate_settings, hardware, metrics.clone())?;
            wait_for_object(gate, shutdown_token.clone()).await
        }
        None => {
            let hardware = SerialRanging::new(config.sensors(), gate_settings.us_per_inch);
            let gate = ProximityGate::new(gate_settings, hardware, metrics.clone())
                .context("Proximity gate unavailable (use --simulate <inches> to run without sensors)")?;
            wait_for_object(gate, shutdown_token.clone()).await
        }
    };

    let GateOutcome::Ready { distance_in, sensor } = gate_outcome else {
        info!("dock-scanner shutdown complete");
        return Ok(());
    };
    egress.write_gate_ready(&session_id, distance_in, sensor);

    let outcome = run_session(session, &egress, shutdown_token).await;
    match outcome {
        SessionOutcome::AllFound { found, frames } => {
            info!(session = %session_id, found = %found, frames = %frames, "manifest_complete");
        }
        SessionOutcome::Cancelled { found, frames } => {
            info!(
                session = %session_id,
                found = %found,
                expected = %manifest.len(),
                frames = %frames,
                "manifest_incomplete"
            );
        }
    }

    metrics.report().log();
    info!("dock-scanner shutdown complete");
    Ok(())
}

/// Run the gate until it fires or shutdown is requested
async fn wait_for_object<H: PulseSensor + 'static>(gate: ProximityGate<H>, shutdown: CancelToken) -> GateOutcome {
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let task = tokio::spawn(gate.run(events_tx, shutdown));

    while let Some(event) = events_rx.recv().await {
        match event {
            GateEvent::Reading { sensor, distance_in, source } => {
                debug!(sensor = %sensor, distance_in = %distance_in, source = %source.as_str(), "gate_status");
            }
            GateEvent::NoReading { sensor } => {
                debug!(sensor = %sensor, "gate_status_no_reading");
            }
            GateEvent::Ready { .. } => {}
        }
    }

    task.await.unwrap_or(GateOutcome::Cancelled)
}

/// Run the acquisition session, forwarding its events to egress
async fn run_session<F: FrameSource + 'static>(
    session: AcquisitionSession<F>,
    egress: &Egress,
    shutdown: CancelToken,
) -> SessionOutcome {
    let session_id = session.id().to_string();
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let task = tokio::spawn(session.run(events_tx, shutdown));

    while let Some(event) = events_rx.recv().await {
        if let SessionEvent::NoReadingThisCycle { frame_index } = event {
            debug!(session = %session_id, frame = %frame_index, "session_no_reading");
            continue;
        }
        egress.write_session_event(&session_id, &event);
    }

    task.await.unwrap_or(SessionOutcome::Cancelled { found: 0, frames: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    // Only test in this binary that touches CONFIG_FILE
    #[test]
    fn test_config_path_precedence() {
        std::env::set_var("CONFIG_FILE", "config/bay3.toml");
        let args = Args::try_parse_from(["dock-scanner", "--manifest", "m.txt"]).unwrap();
        assert_eq!(args.config, "config/bay3.toml");

        let args = Args::try_parse_from(["dock-scanner", "-m", "m.txt", "--config=config/bay4.toml"]).unwrap();
        assert_eq!(args.config, "config/bay4.toml");

        std::env::remove_var("CONFIG_FILE");
        let args = Args::try_parse_from(["dock-scanner", "-m", "m.txt"]).unwrap();
        assert_eq!(args.config, "config/dev.toml");
    }
}
