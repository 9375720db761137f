//! End-to-end scan: object arrives, labels are read from frames on disk,
//! and every step lands in the event log.

use dock_scanner::domain::{GateEvent, SensorId, SessionEvent, ShipmentManifest};
use dock_scanner::infra::{cancel_pair, Config, Metrics};
use dock_scanner::io::{Egress, FnReader, ImageDirSource, ScriptedPulses, WholeFrameProposer};
use dock_scanner::services::{
    AcquisitionSession, DecoderSettings, GateOutcome, ProximityGate, SessionOutcome, SymbolDecoder,
};
use image::{GrayImage, Luma};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Labels are encoded as frame brightness
fn brightness_decoder() -> Arc<SymbolDecoder> {
    let reader = FnReader(|img: &GrayImage| {
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return Vec::new();
        }
        match img.get_pixel(w / 2, h / 2)[0] {
            90..=110 => vec!["ship-0001".to_string()],
            190..=210 => vec!["SHIP-0002".to_string()],
            _ => Vec::new(),
        }
    });
    Arc::new(SymbolDecoder::new(DecoderSettings::default(), Arc::new(reader)).unwrap())
}

fn write_frame(dir: &std::path::Path, name: &str, level: u8) {
    GrayImage::from_pixel(64, 48, Luma([level])).save(dir.join(name)).unwrap();
}

#[tokio::test]
async fn test_gate_then_session_completes_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let frames_dir = dir.path().join("frames");
    std::fs::create_dir(&frames_dir).unwrap();
    write_frame(&frames_dir, "001.png", 0);
    write_frame(&frames_dir, "002.png", 100);
    write_frame(&frames_dir, "003.png", 200);
    let log_path = dir.path().join("out").join("events.jsonl");

    let metrics = Arc::new(Metrics::new());
    let egress = Egress::new(log_path.to_str().unwrap(), "test-dock");

    // Gate: sensor 2 sees the object after one far read
    let mut gate_settings = Config::default().gate_settings().unwrap();
    gate_settings.settle = Duration::from_millis(1);
    gate_settings.quiet = Duration::from_millis(1);
    gate_settings.sample_gap = Duration::ZERO;
    gate_settings.sample_timeout = Duration::from_millis(5);
    gate_settings.soft_min_in = gate_settings.band.hard_min_in;

    let pulses = ScriptedPulses::new(gate_settings.us_per_inch)
        .with_fallback_inches(SensorId(1), 40.0)
        .with_inches(SensorId(2), &[Some(40.0); 5])
        .with_fallback_inches(SensorId(2), 10.0);
    let gate = ProximityGate::new(gate_settings, pulses, metrics.clone()).unwrap();

    let (_shutdown, token) = cancel_pair();
    let (gate_tx, mut gate_rx) = mpsc::channel(64);
    let gate_task = tokio::spawn(gate.run(gate_tx, token.clone()));
    let mut readings = 0;
    while let Some(event) = timeout(Duration::from_secs(5), gate_rx.recv()).await.unwrap() {
        if matches!(event, GateEvent::Reading { .. }) {
            readings += 1;
        }
    }
    let outcome = gate_task.await.unwrap();
    assert_eq!(outcome, GateOutcome::Ready { distance_in: 10.0, sensor: SensorId(2) });
    assert!(readings >= 3);

    // Session: the labels are on the second and third frames
    let manifest = ShipmentManifest::parse("SHIP-0001\nship-0002\n").unwrap();
    let frames = ImageDirSource::open(&frames_dir, false).unwrap();
    let mut session_settings = Config::default().session_settings().unwrap();
    session_settings.cadence = Duration::from_millis(5);
    let session = AcquisitionSession::new(
        &manifest,
        frames,
        Arc::new(WholeFrameProposer),
        brightness_decoder(),
        session_settings,
        metrics.clone(),
    )
    .unwrap();
    let session_id = session.id().to_string();

    if let GateOutcome::Ready { distance_in, sensor } = outcome {
        assert!(egress.write_gate_ready(&session_id, distance_in, sensor));
    }

    let (session_tx, mut session_rx) = mpsc::channel(64);
    let session_task = tokio::spawn(session.run(session_tx, token));
    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(10), session_rx.recv()).await.unwrap() {
        egress.write_session_event(&session_id, &event);
        events.push(event);
    }
    assert_eq!(session_task.await.unwrap(), SessionOutcome::AllFound { found: 2, frames: 3 });
    assert_eq!(events.first(), Some(&SessionEvent::NoReadingThisCycle { frame_index: 1 }));
    assert_eq!(events.last(), Some(&SessionEvent::AllFound { found: 2 }));

    let log = std::fs::read_to_string(&log_path).unwrap();
    let records: Vec<serde_json::Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    let kinds: Vec<&str> = records.iter().map(|r| r["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["gate_ready", "decoded", "matched", "decoded", "matched", "all_found"]);
    assert!(records.iter().all(|r| r["session"] == session_id.as_str() && r["site"] == "test-dock"));
    assert_eq!(records[0]["sensor"], 2);
    assert_eq!(records[2]["canonical"], "SHIP-0001");
    assert_eq!(records[2]["code"], "ship-0001");
    assert_eq!(records[4]["canonical"], "ship-0002");
    assert_eq!(records[5]["found"], 2);

    assert_eq!(metrics.frames_pulled(), 3);
    assert_eq!(metrics.matched(), 2);
}

#[tokio::test]
async fn test_cancel_stops_waiting_gate() {
    let mut settings = Config::default().gate_settings().unwrap();
    settings.sample_timeout = Duration::from_millis(5);
    settings.settle = Duration::from_millis(1);
    settings.quiet = Duration::from_millis(1);

    // Nothing ever comes close
    let pulses = ScriptedPulses::constant(&settings.sensors, 100.0, settings.us_per_inch);
    let mut handle = ProximityGate::new(settings, pulses, Arc::new(Metrics::new())).unwrap().spawn(8);

    let first = timeout(Duration::from_secs(5), handle.events.recv()).await.unwrap();
    assert!(matches!(first, Some(GateEvent::Reading { .. })));

    handle.cancel();
    let outcome = timeout(Duration::from_secs(5), handle.finish()).await.unwrap();
    assert_eq!(outcome, GateOutcome::Cancelled);
}
