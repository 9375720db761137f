//! Scan event egress - writes gate and session events to file
//!
//! Events are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::domain::types::{epoch_ms, SensorId, SessionEvent};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// One line of the event log. Absent fields are omitted.
#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    session: &'a str,
    site: &'a str,
    ts: u64,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    canonical: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance_in: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sensor: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    found: Option<usize>,
}

impl<'a> EventRecord<'a> {
    fn new(session: &'a str, site: &'a str, kind: &'static str) -> Self {
        Self {
            session,
            site,
            ts: epoch_ms(),
            kind,
            code: None,
            canonical: None,
            method: None,
            duplicate: None,
            frame: None,
            distance_in: None,
            sensor: None,
            found: None,
        }
    }
}

/// Egress writer for scan events
pub struct Egress {
    file_path: String,
    site: String,
}

impl Egress {
    pub fn new(file_path: &str, site: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string(), site: site.to_string() }
    }

    /// Record the gate decision that started a session
    pub fn write_gate_ready(&self, session: &str, distance_in: f64, sensor: SensorId) -> bool {
        let mut record = EventRecord::new(session, &self.site, "gate_ready");
        record.distance_in = Some(distance_in);
        record.sensor = Some(sensor.0);
        self.write_record(&record)
    }

    /// Write a session event. Per-cycle "nothing decoded" events are not
    /// persisted.
    /// Returns true if written, false otherwise
    pub fn write_session_event(&self, session: &str, event: &SessionEvent) -> bool {
        let mut record = EventRecord::new(session, &self.site, event.kind());
        match event {
            SessionEvent::Decoded { code, frame_index } => {
                record.code = Some(code);
                record.frame = Some(*frame_index);
            }
            SessionEvent::Matched { code, decoded, method, duplicate } => {
                record.code = Some(decoded);
                record.canonical = Some(code);
                record.method = Some(method.as_str());
                record.duplicate = Some(*duplicate);
            }
            SessionEvent::NotInManifest { code } => {
                record.code = Some(code);
            }
            SessionEvent::AllFound { found } => {
                record.found = Some(*found);
            }
            SessionEvent::NoReadingThisCycle { .. } => return false,
        }
        self.write_record(&record)
    }

    fn write_record(&self, record: &EventRecord<'_>) -> bool {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!(kind = %record.kind, error = %e, "egress_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    session = %record.session,
                    kind = %record.kind,
                    error = %e,
                    "egress_write_failed"
                );
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}
