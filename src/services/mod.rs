//! Services - scanning logic and loop orchestration
//!
//! This module contains the core services:
//! - `proximity_gate` - Dual ultrasonic presence detection
//! - `acquisition` - Frame loop: regions, decode, manifest reconciliation
//! - `symbol_decoder` - Enhancement/rotation decode ladder
//! - `manifest_matcher` - Exact case-insensitive manifest lookup

pub mod acquisition;
pub mod manifest_matcher;
pub mod proximity_gate;
pub mod symbol_decoder;

// Re-export commonly used types
pub use acquisition::{AcquisitionSession, SessionError, SessionHandle, SessionOutcome, SessionSettings};
pub use manifest_matcher::{ManifestMatcher, MatchResult, MatchState};
pub use proximity_gate::{GateError, GateHandle, GateOutcome, GateSettings, ProximityGate};
pub use symbol_decoder::{DecoderSettings, Ladder, SymbolDecoder};
