//! # Delivery Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! chunks_per_tick = 4
//! worker_threads = 2
//! tick_rate = 20
//! spawn_threshold = 56
//! obfuscated_worlds = [1, 3]
//!
//! [compression]
//! algorithm = "lz4"
//! threshold = 256
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use umbra_core::{CompressionConfig, WorldId};

use crate::error::{DeliveryError, DeliveryResult};
use crate::session::SessionConfig;

/// Default generation budget per session.
pub const DEFAULT_CHUNKS_PER_TICK: usize = 4;

/// Default control loop rate (Hz).
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    /// Cells a session may have in generation at once.
    pub chunks_per_tick: usize,
    /// Worker pool size.
    pub worker_threads: usize,
    /// Control loop rate (Hz).
    pub tick_rate: u32,
    /// Cells sent before the client is told terrain is ready; the notice
    /// goes out with the next one.
    pub spawn_threshold: usize,
    /// Worlds whose cells go through the cell transform.
    pub obfuscated_worlds: Vec<u32>,
    /// Payload compression.
    pub compression: CompressionConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunks_per_tick: DEFAULT_CHUNKS_PER_TICK,
            worker_threads: 2,
            tick_rate: DEFAULT_TICK_RATE,
            spawn_threshold: 56,
            obfuscated_worlds: Vec::new(),
            compression: CompressionConfig::lz4(),
        }
    }
}

impl DeliveryConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::InvalidConfig`] on syntax errors, unknown keys or
    /// out-of-range values.
    pub fn from_toml_str(text: &str) -> DeliveryResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DeliveryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::InvalidConfig`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> DeliveryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeliveryError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.chunks_per_tick == 0 {
            return Err(DeliveryError::InvalidConfig("chunks_per_tick must be at least 1".to_owned()));
        }
        if self.worker_threads == 0 {
            return Err(DeliveryError::InvalidConfig("worker_threads must be at least 1".to_owned()));
        }
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(DeliveryError::InvalidConfig("tick_rate must be within 1..=1000".to_owned()));
        }
        Ok(())
    }

    /// Limits handed to every new session.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunks_per_tick: self.chunks_per_tick,
            spawn_threshold: self.spawn_threshold,
            compression: self.compression,
        }
    }

    /// Obfuscated worlds as identifiers.
    pub fn obfuscated_world_ids(&self) -> impl Iterator<Item = WorldId> + '_ {
        self.obfuscated_worlds.iter().copied().map(WorldId)
    }
}
