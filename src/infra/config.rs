//! Configuration loading from TOML files
//!
//! Config file is selected by the binaries: `--config <path>`, else the
//! CONFIG_FILE environment variable, else config/dev.toml.
//!
//! Every section is optional; missing values fall back to the bench-tested
//! defaults below. Semantic validation happens when component settings are
//! built (`gate_settings`, `session_settings`, `decoder_settings`), so a bad
//! value fails before any loop starts.

use crate::domain::types::{PlausibilityBand, SensorId};
use crate::services::acquisition::{CropSettings, SessionSettings, MAX_SHRINK};
use crate::services::proximity_gate::GateSettings;
use crate::services::symbol_decoder::DecoderSettings;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no sensors configured")]
    NoSensors,
    #[error("sensor id {0} configured more than once")]
    DuplicateSensor(u8),
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("plausibility band is empty: hard_min_in {hard_min_in} >= max_in {max_in}")]
    EmptyBand { hard_min_in: f64, max_in: f64 },
    #[error("variant_level must be 1..=3, got {0}")]
    VariantLevel(u8),
    #[error("min_confidence must be in [0.0, 1.0], got {0}")]
    Confidence(f32),
    #[error("shrink must be in [0.0, 0.45], got {0}")]
    Shrink(f32),
}

/// Which sensors must see the object before the gate fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPolicy {
    /// Any single sensor within the trigger distance
    #[default]
    Either,
    /// The latest value of every sensor within the trigger distance
    All,
}

impl TriggerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerPolicy::Either => "either",
            TriggerPolicy::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SensorConfig {
    pub id: u8,
    pub device: String,
    #[serde(default = "default_sensor_baud")]
    pub baud: u32,
}

fn default_sensor_baud() -> u32 {
    9600
}

fn default_sensors() -> Vec<SensorConfig> {
    vec![
        SensorConfig { id: 1, device: "/dev/ttyTHS1".to_string(), baud: default_sensor_baud() },
        SensorConfig { id: 2, device: "/dev/ttyTHS2".to_string(), baud: default_sensor_baud() },
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub trigger_distance_in: f64,
    /// Wait after switching sensors so the other sensor's echo dies out
    pub settle_ms: u64,
    /// Wait after a read that did not trigger
    pub quiet_ms: u64,
    pub samples_per_read: usize,
    pub sample_timeout_ms: u64,
    pub sample_gap_ms: u64,
    pub hard_min_in: f64,
    pub soft_min_in: f64,
    pub max_in: f64,
    /// MaxSonar pulse-width scale factor
    pub us_per_inch: f64,
    pub policy: TriggerPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            trigger_distance_in: 13.0,
            settle_ms: 3000,
            quiet_ms: 500,
            samples_per_read: 5,
            sample_timeout_ms: 50,
            sample_gap_ms: 50,
            hard_min_in: 6.0,
            soft_min_in: 13.0,
            max_in: 254.0,
            us_per_inch: 147.0,
            policy: TriggerPolicy::Either,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub cadence_ms: u64,
    pub frame_timeout_ms: u64,
    pub decode_every: u64,
    /// Whole-frame decode interval when no region decodes (0 disables)
    pub fallback_every: u64,
    pub max_regions: usize,
    pub min_confidence: f32,
    pub pad_px: u32,
    pub pad_pct: f32,
    pub shrink: f32,
    pub min_region_width: u32,
    pub region_upscale: f32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 200,
            frame_timeout_ms: 1000,
            decode_every: 1,
            fallback_every: 15,
            max_regions: 6,
            min_confidence: 0.25,
            pad_px: 8,
            pad_pct: 0.06,
            shrink: 0.10,
            min_region_width: 360,
            region_upscale: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// 1 = gray + upscale, 2 = + local equalization, 3 = + adaptive binarization
    pub variant_level: u8,
    pub upscale_factor: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub binarize_block_radius: u32,
    /// Edge-preserving smoothing of regions and frames before decoding
    pub denoise: bool,
    pub sharpen_regions: bool,
    /// Path or name of the zbarimg executable
    pub zbarimg: String,
    /// A zbarimg run longer than this is killed and counts as no read
    pub reader_timeout_ms: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            variant_level: 3,
            upscale_factor: 2.0,
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
            binarize_block_radius: 15,
            denoise: true,
            sharpen_regions: true,
            zbarimg: "zbarimg".to_string(),
            reader_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    /// Directory of still images replayed as camera frames
    pub dir: String,
    pub repeat: bool,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self { dir: "frames".to_string(), repeat: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// File path for session events (JSONL format)
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: "scan_events.jsonl".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Unique dock/station identifier
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "dock".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub frames: FramesConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    sensors: Vec<SensorConfig>,
    gate: GateConfig,
    acquisition: AcquisitionConfig,
    decoder: DecoderConfig,
    frames: FramesConfig,
    egress_file: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(
            TomlConfig { sensors: default_sensors(), ..TomlConfig::default() },
            "default".to_string(),
        )
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            sensors: toml_config.sensors,
            gate: toml_config.gate,
            acquisition: toml_config.acquisition,
            decoder: toml_config.decoder,
            frames: toml_config.frames,
            egress_file: toml_config.egress.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).context("Failed to parse config")?;
        Ok(Self::from_toml(toml_config, "inline".to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Validated settings for the proximity gate
    pub fn gate_settings(&self) -> Result<GateSettings, ConfigError> {
        let g = &self.gate;
        let settings = GateSettings {
            sensors: self.sensors.iter().map(|s| SensorId(s.id)).collect(),
            trigger_distance_in: g.trigger_distance_in,
            settle: Duration::from_millis(g.settle_ms),
            quiet: Duration::from_millis(g.quiet_ms),
            samples_per_read: g.samples_per_read,
            sample_timeout: Duration::from_millis(g.sample_timeout_ms),
            sample_gap: Duration::from_millis(g.sample_gap_ms),
            band: PlausibilityBand { hard_min_in: g.hard_min_in, max_in: g.max_in },
            soft_min_in: g.soft_min_in,
            us_per_inch: g.us_per_inch,
            policy: g.policy,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validated settings for an acquisition session
    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        let a = &self.acquisition;
        let settings = SessionSettings {
            cadence: Duration::from_millis(a.cadence_ms),
            frame_timeout: Duration::from_millis(a.frame_timeout_ms),
            decode_every: a.decode_every,
            fallback_every: a.fallback_every,
            max_regions: a.max_regions,
            min_confidence: a.min_confidence,
            crop: CropSettings {
                pad_px: a.pad_px,
                pad_pct: a.pad_pct,
                shrink: a.shrink.clamp(0.0, MAX_SHRINK),
                min_width: a.min_region_width,
                upscale: a.region_upscale,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validated settings for the symbol decoder
    pub fn decoder_settings(&self) -> Result<DecoderSettings, ConfigError> {
        let d = &self.decoder;
        let settings = DecoderSettings {
            variant_level: d.variant_level,
            upscale_factor: d.upscale_factor,
            clahe_clip_limit: d.clahe_clip_limit,
            clahe_tiles: d.clahe_tiles,
            binarize_block_radius: d.binarize_block_radius,
            denoise: d.denoise,
            sharpen: d.sharpen_regions,
        };
        settings.validate()?;
        if d.reader_timeout_ms == 0 {
            return Err(ConfigError::NonPositive("reader_timeout_ms"));
        }
        Ok(settings)
    }

    // Getters
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn sensors(&self) -> &[SensorConfig] {
        &self.sensors
    }

    pub fn trigger_policy(&self) -> TriggerPolicy {
        self.gate.policy
    }

    pub fn trigger_distance_in(&self) -> f64 {
        self.gate.trigger_distance_in
    }

    pub fn cadence_ms(&self) -> u64 {
        self.acquisition.cadence_ms
    }

    pub fn variant_level(&self) -> u8 {
        self.decoder.variant_level
    }

    pub fn zbarimg(&self) -> &str {
        &self.decoder.zbarimg
    }

    pub fn reader_timeout_ms(&self) -> u64 {
        self.decoder.reader_timeout_ms
    }

    pub fn frames_dir(&self) -> &str {
        &self.frames.dir
    }

    pub fn frames_repeat(&self) -> bool {
        self.frames.repeat
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to replace the sensor list
    pub fn with_sensors(mut self, sensors: Vec<SensorConfig>) -> Self {
        self.sensors = sensors;
        self
    }

    /// Builder method for tests to shorten gate timings
    #[cfg(test)]
    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "dock");
        assert_eq!(config.sensors().len(), 2);
        assert_eq!(config.trigger_policy(), TriggerPolicy::Either);
        assert_eq!(config.trigger_distance_in(), 13.0);
        assert_eq!(config.cadence_ms(), 200);
        assert_eq!(config.variant_level(), 3);
        assert_eq!(config.egress_file(), "scan_events.jsonl");
    }

    #[test]
    fn test_default_settings_are_valid() {
        let config = Config::default();
        let gate = config.gate_settings().unwrap();
        assert_eq!(gate.sensors, vec![SensorId(1), SensorId(2)]);
        assert_eq!(gate.settle, Duration::from_secs(3));
        assert!(config.session_settings().is_ok());
        assert!(config.decoder_settings().is_ok());
    }

    #[test]
    fn test_zero_sensors_rejected() {
        let config = Config::default().with_sensors(vec![]);
        assert_eq!(config.gate_settings().unwrap_err(), ConfigError::NoSensors);
    }

    #[test]
    fn test_duplicate_sensor_rejected() {
        let sensor = SensorConfig { id: 4, device: "/dev/null".to_string(), baud: 9600 };
        let config = Config::default().with_sensors(vec![sensor.clone(), sensor]);
        assert_eq!(config.gate_settings().unwrap_err(), ConfigError::DuplicateSensor(4));
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        let gate = GateConfig { sample_timeout_ms: 0, ..GateConfig::default() };
        let config = Config::default().with_gate(gate);
        assert_eq!(
            config.gate_settings().unwrap_err(),
            ConfigError::NonPositive("sample_timeout")
        );
    }

    #[test]
    fn test_shrink_is_clamped() {
        let config = Config::from_toml_str("[acquisition]\nshrink = 0.9\n").unwrap();
        let settings = config.session_settings().unwrap();
        assert!((settings.crop.shrink - 0.45).abs() < f32::EPSILON);
    }

    #[test]
    fn test_bad_variant_level_rejected() {
        let config = Config::from_toml_str("[decoder]\nvariant_level = 7\n").unwrap();
        assert_eq!(config.decoder_settings().unwrap_err(), ConfigError::VariantLevel(7));
    }

    #[test]
    fn test_zero_reader_timeout_rejected() {
        let config = Config::from_toml_str("[decoder]\nreader_timeout_ms = 0\n").unwrap();
        assert_eq!(
            config.decoder_settings().unwrap_err(),
            ConfigError::NonPositive("reader_timeout_ms")
        );
        assert_eq!(Config::default().reader_timeout_ms(), 2000);
    }
}
