//! Ultrasonic ranging backends
//!
//! The gate only needs one primitive: the width of the next echo pulse for a
//! given sensor, bounded by a timeout. Backends:
//! - `SerialRanging` - MaxSonar sensors on their serial outputs
//! - `ScriptedPulses` - deterministic pulses for simulation and tests
//! - `AbsentHardware` - a backend that cannot be initialized
//!
//! MaxSonar serial protocol:
//! - 9600 baud, 8N1, one frame per ranging cycle
//! - Frame: 'R' followed by three ASCII digits (inches) and CR
//! - Reported in the pulse-width domain at the configured us-per-inch scale

use crate::domain::types::SensorId;
use crate::infra::config::SensorConfig;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

// Protocol constants
const START_BYTE: u8 = b'R';
const END_BYTE: u8 = b'\r';
const FRAME_LEN: usize = 5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HardwareError {
    #[error("ranging hardware unavailable for sensor {sensor}: {reason}")]
    Unavailable { sensor: SensorId, reason: String },
    #[error("ranging backend unavailable: {0}")]
    Backend(String),
}

/// Hardware ranging primitive shared by all sensors of one gate
#[async_trait]
pub trait PulseSensor: Send {
    /// Verify the backend can be used. Called once when the gate is built.
    fn check(&mut self) -> Result<(), HardwareError>;

    /// Width of the next echo pulse in microseconds, `None` on timeout.
    async fn measure_pulse(&mut self, sensor: SensorId, timeout: Duration) -> Option<f64>;
}

/// Extract the next range frame from the buffer, discarding noise.
/// Returns the distance in inches.
fn parse_frame(buf: &mut BytesMut) -> Option<u32> {
    loop {
        // Synchronize to the start byte
        match buf.iter().position(|&b| b == START_BYTE) {
            Some(0) => {}
            Some(idx) => {
                debug!(discarded = idx, "ranging_sync_discarded_bytes");
                buf.advance(idx);
            }
            None => {
                buf.clear();
                return None;
            }
        }

        if buf.len() < FRAME_LEN {
            return None;
        }

        let frame = &buf[..FRAME_LEN];
        if frame[FRAME_LEN - 1] == END_BYTE && frame[1..4].iter().all(u8::is_ascii_digit) {
            let inches = frame[1..4].iter().fold(0u32, |acc, &d| acc * 10 + (d - b'0') as u32);
            buf.advance(FRAME_LEN);
            return Some(inches);
        }

        // Corrupt frame, skip this start byte and resync
        tracing::trace!(raw = ?&buf[..FRAME_LEN], "ranging_frame_corrupt");
        buf.advance(1);
    }
}

struct SerialChannel {
    device: String,
    baud: u32,
    port: Option<tokio_serial::SerialStream>,
    buffer: BytesMut,
}

/// MaxSonar sensors read over their serial outputs, one port per sensor
pub struct SerialRanging {
    channels: FxHashMap<SensorId, SerialChannel>,
    us_per_inch: f64,
}

impl SerialRanging {
    pub fn new(sensors: &[SensorConfig], us_per_inch: f64) -> Self {
        let channels = sensors
            .iter()
            .map(|s| {
                (
                    SensorId(s.id),
                    SerialChannel {
                        device: s.device.clone(),
                        baud: s.baud,
                        port: None,
                        buffer: BytesMut::with_capacity(64),
                    },
                )
            })
            .collect();
        Self { channels, us_per_inch }
    }
}

#[async_trait]
impl PulseSensor for SerialRanging {
    fn check(&mut self) -> Result<(), HardwareError> {
        if self.channels.is_empty() {
            return Err(HardwareError::Backend("no serial channels configured".to_string()));
        }
        for (sensor, channel) in self.channels.iter_mut() {
            let port = tokio_serial::new(&channel.device, channel.baud)
                .timeout(Duration::from_millis(100))
                .open_native_async()
                .map_err(|e| HardwareError::Unavailable {
                    sensor: *sensor,
                    reason: format!("{}: {}", channel.device, e),
                })?;
            info!(sensor = %sensor, device = %channel.device, baud = %channel.baud, "ranging_port_opened");
            channel.port = Some(port);
        }
        Ok(())
    }

    async fn measure_pulse(&mut self, sensor: SensorId, timeout: Duration) -> Option<f64> {
        let channel = self.channels.get_mut(&sensor)?;
        let port = channel.port.as_mut()?;

        // Only frames that arrive during this sample count
        channel.buffer.clear();
        let mut temp_buf = [0u8; 32];

        let read = tokio::time::timeout(timeout, async {
            loop {
                match port.read(&mut temp_buf).await {
                    Ok(0) => {}
                    Ok(n) => {
                        channel.buffer.extend_from_slice(&temp_buf[..n]);
                        if let Some(inches) = parse_frame(&mut channel.buffer) {
                            return Some(inches);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(sensor = %sensor, error = %e, "ranging_read_error");
                        return None;
                    }
                }
            }
        })
        .await;

        match read {
            Ok(Some(inches)) => Some(inches as f64 * self.us_per_inch),
            _ => None,
        }
    }
}

/// Deterministic pulse source
///
/// Each sensor replays its script in order, then repeats its fallback value
/// (or times out when there is none). A scripted timeout waits the full
/// timeout before returning, like real hardware.
#[derive(Clone, Default)]
pub struct ScriptedPulses {
    scripts: FxHashMap<SensorId, VecDeque<Option<f64>>>,
    fallback: FxHashMap<SensorId, f64>,
    us_per_inch: f64,
    reads: Arc<Mutex<Vec<SensorId>>>,
}

impl ScriptedPulses {
    pub fn new(us_per_inch: f64) -> Self {
        Self { us_per_inch, ..Self::default() }
    }

    /// Append samples given in inches; `None` is a timeout
    pub fn with_inches(mut self, sensor: SensorId, samples: &[Option<f64>]) -> Self {
        let us_per_inch = self.us_per_inch;
        self.scripts
            .entry(sensor)
            .or_default()
            .extend(samples.iter().map(|s| s.map(|inches| inches * us_per_inch)));
        self
    }

    /// Every sensor reports `inches` on every sample
    pub fn constant(sensors: &[SensorId], inches: f64, us_per_inch: f64) -> Self {
        sensors
            .iter()
            .fold(Self::new(us_per_inch), |pulses, sensor| pulses.with_fallback_inches(*sensor, inches))
    }

    /// Value returned once the script for `sensor` is exhausted
    pub fn with_fallback_inches(mut self, sensor: SensorId, inches: f64) -> Self {
        self.fallback.insert(sensor, inches * self.us_per_inch);
        self
    }

    /// Shared log of which sensor each measurement was taken from
    pub fn read_log(&self) -> Arc<Mutex<Vec<SensorId>>> {
        self.reads.clone()
    }
}

#[async_trait]
impl PulseSensor for ScriptedPulses {
    fn check(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    async fn measure_pulse(&mut self, sensor: SensorId, timeout: Duration) -> Option<f64> {
        self.reads.lock().push(sensor);
        let next = match self.scripts.get_mut(&sensor).and_then(|q| q.pop_front()) {
            Some(pulse) => pulse,
            None => self.fallback.get(&sensor).copied(),
        };
        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        next
    }
}

/// Backend whose driver is missing; fails the gate at construction
#[derive(Debug, Clone)]
pub struct AbsentHardware {
    reason: String,
}

impl AbsentHardware {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl PulseSensor for AbsentHardware {
    fn check(&mut self) -> Result<(), HardwareError> {
        Err(HardwareError::Backend(self.reason.clone()))
    }

    async fn measure_pulse(&mut self, _sensor: SensorId, _timeout: Duration) -> Option<f64> {
        None
    }
}
