//! Infrastructure - configuration, metrics, and cancellation
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, validation)
//! - `metrics` - Lock-free metrics collection
//! - `cancel` - Cooperative cancellation shared by the gate and session loops

pub mod cancel;
pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use cancel::{cancel_pair, CancelHandle, CancelToken, Cancelled};
pub use config::{Config, ConfigError, TriggerPolicy};
pub use metrics::Metrics;
