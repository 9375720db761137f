//! IO modules - external system interfaces
//!
//! This module contains all hardware and file IO:
//! - `ranging` - Ultrasonic pulse measurement (serial MaxSonar, scripted)
//! - `frames` - Camera frame sources
//! - `regions` - Barcode region proposers
//! - `symbol_reader` - Symbol reading primitive (zbar)
//! - `egress` - Scan events output to file (JSONL format)

pub mod egress;
pub mod frames;
pub mod ranging;
pub mod regions;
pub mod symbol_reader;

// Re-export commonly used types
pub use egress::Egress;
pub use frames::{FrameSource, FrameSourceError, ImageDirSource, ScriptedFrames};
pub use ranging::{AbsentHardware, HardwareError, PulseSensor, ScriptedPulses, SerialRanging};
pub use regions::{FixedProposer, RegionProposer, WholeFrameProposer};
pub use symbol_reader::{FnReader, SymbolReader, SymbolReaderError, ZbarCommandReader};
