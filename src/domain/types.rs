//! Shared types for the dock scanner

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for ultrasonic sensor IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct SensorId(pub u8);

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hard plausibility band for a single distance sample (inches)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlausibilityBand {
    pub hard_min_in: f64,
    pub max_in: f64,
}

impl PlausibilityBand {
    #[inline]
    pub fn contains(&self, distance_in: f64) -> bool {
        distance_in.is_finite() && distance_in >= self.hard_min_in && distance_in <= self.max_in
    }
}

/// One distance estimate from one sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangingSample {
    pub sensor: SensorId,
    pub distance_in: f64,
    pub valid: bool,
}

impl RangingSample {
    /// Convert a raw pulse width into a sample.
    ///
    /// `None` (no pulse within the timeout) and anything outside the band
    /// produce an invalid sample.
    pub fn from_pulse(
        sensor: SensorId,
        pulse_us: Option<f64>,
        us_per_inch: f64,
        band: &PlausibilityBand,
    ) -> Self {
        match pulse_us {
            Some(width_us) => {
                let distance_in = width_us / us_per_inch;
                Self { sensor, distance_in, valid: band.contains(distance_in) }
            }
            None => Self { sensor, distance_in: 0.0, valid: false },
        }
    }
}

/// Per-sensor smoothing state, owned by one gate run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorState {
    pub last_valid_in: Option<f64>,
}

/// How a per-read distance was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingSource {
    /// Trimmed mean of this read's samples
    Fresh,
    /// Fresh value below the soft minimum, averaged with the previous value
    Smoothed,
    /// No sample survived; previous valid value reused
    Held,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::Fresh => "fresh",
            ReadingSource::Smoothed => "smoothed",
            ReadingSource::Held => "held",
        }
    }
}

/// Axis-aligned box in pixel coordinates, `x2`/`y2` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    #[inline]
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Candidate barcode region with detector confidence in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionProposal {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Payload decoded from a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    pub payload: String,
    pub frame_index: u64,
}

/// How a decoded payload was reconciled against the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    None,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Exact => "exact",
            MatchMethod::None => "none",
        }
    }
}

/// Events emitted by the proximity gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// A sensor produced a usable distance this read
    Reading { sensor: SensorId, distance_in: f64, source: ReadingSource },
    /// A sensor produced nothing usable and had no previous value
    NoReading { sensor: SensorId },
    /// Object present; emitted once, after which the gate stops
    Ready { distance_in: f64, sensor: SensorId },
}

/// Events emitted by an acquisition session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A distinct payload decoded from a frame
    Decoded { code: String, frame_index: u64 },
    /// Payload is part of the manifest; `code` is the manifest spelling
    Matched { code: String, decoded: String, method: MatchMethod, duplicate: bool },
    /// Payload decoded but not expected in this shipment
    NotInManifest { code: String },
    /// Nothing decoded this cycle (no frame, skipped frame, or no payload)
    NoReadingThisCycle { frame_index: u64 },
    /// Every manifest code has been observed; emitted once, then the session stops
    AllFound { found: usize },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Decoded { .. } => "decoded",
            SessionEvent::Matched { .. } => "matched",
            SessionEvent::NotInManifest { .. } => "not_in_manifest",
            SessionEvent::NoReadingThisCycle { .. } => "no_reading",
            SessionEvent::AllFound { .. } => "all_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BAND: PlausibilityBand = PlausibilityBand { hard_min_in: 6.0, max_in: 254.0 };

    #[test]
    fn test_sample_from_pulse() {
        let sample = RangingSample::from_pulse(SensorId(1), Some(1470.0), 147.0, &BAND);
        assert!(sample.valid);
        assert!((sample.distance_in - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_outside_band_is_invalid() {
        // 2 in is closer than any physical echo
        let close = RangingSample::from_pulse(SensorId(1), Some(294.0), 147.0, &BAND);
        assert!(!close.valid);

        let far = RangingSample::from_pulse(SensorId(1), Some(147.0 * 300.0), 147.0, &BAND);
        assert!(!far.valid);

        let timeout = RangingSample::from_pulse(SensorId(2), None, 147.0, &BAND);
        assert!(!timeout.valid);
    }

    #[test]
    fn test_bounding_box_geometry() {
        let bbox = BoundingBox::new(10, 20, 110, 70);
        assert_eq!(bbox.width(), 100);
        assert_eq!(bbox.height(), 50);
        assert_eq!(bbox.area(), 5000);
        assert!(!bbox.is_empty());
        assert!(BoundingBox::new(5, 5, 5, 9).is_empty());
        assert!(BoundingBox::new(9, 5, 5, 9).is_empty());
    }

    #[test]
    fn test_uuid_v7_generation() {
        let a = new_uuid_v7();
        let b = new_uuid_v7();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }
}
