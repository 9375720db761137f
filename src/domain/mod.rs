//! Domain models - value types shared by the gate and the acquisition session
//!
//! This module contains the canonical data types used throughout the system:
//! - `RangingSample` / `SensorState` - per-sensor distance readings and smoothing state
//! - `RegionProposal` / `BoundingBox` - candidate barcode regions in a frame
//! - `ShipmentManifest` - the expected set of barcode payloads
//! - `GateEvent` / `SessionEvent` - events surfaced to display and logging consumers

pub mod manifest;
pub mod types;

// Re-export commonly used types at module level
pub use manifest::{ManifestError, ShipmentManifest};
pub use types::{GateEvent, SensorId, SessionEvent};
