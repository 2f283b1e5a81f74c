use crate::Carrier;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Protocol constants
pub mod protocol {
    /// XML namespace of in-band bytestream elements
    pub const NS: &str = "http://jabber.org/protocol/ibb";

    /// Default block size in raw bytes per data frame.
    /// Base64 makes the on-wire payload roughly a third larger.
    pub const DEFAULT_BLOCK_SIZE: u16 = 4096;

    /// Largest block size the `block-size` attribute can express
    pub const MAX_BLOCK_SIZE: u16 = u16::MAX;

    /// Random bytes behind a generated session id
    pub const SID_BYTES: usize = 8;

    /// Default time in milliseconds to wait for the peer to answer an open request
    pub const OPEN_TIMEOUT_MS: u64 = 30_000;

    /// Default number of negotiated streams waiting for accept
    pub const ACCEPT_BACKLOG: usize = 16;

    /// Default number of decoded frames buffered per stream
    pub const INBOUND_BUFFER_FRAMES: usize = 64;
}

/// Bytestream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IbbConfig {
    /// Block size used when an open does not ask for one
    pub default_block_size: u16,

    /// Largest block size accepted from a peer
    pub max_block_size: u16,

    /// Carrier used by `open` when none is given
    pub default_carrier: Carrier,

    /// Milliseconds to wait for an open request to be answered
    pub open_timeout_ms: u64,

    /// Streams queued per listener before inbound opens wait (0 = unbounded)
    pub accept_backlog: usize,

    /// Decoded frames buffered per stream before inbound data waits
    pub inbound_buffer_frames: usize,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for IbbConfig {
    fn default() -> Self {
        Self {
            default_block_size: protocol::DEFAULT_BLOCK_SIZE,
            max_block_size: protocol::MAX_BLOCK_SIZE,
            default_carrier: Carrier::Iq,
            open_timeout_ms: protocol::OPEN_TIMEOUT_MS,
            accept_backlog: protocol::ACCEPT_BACKLOG,
            inbound_buffer_frames: protocol::INBOUND_BUFFER_FRAMES,
            verbose: false,
        }
    }
}

impl IbbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: u16) -> Self {
        self.default_block_size = block_size;
        self
    }

    pub fn with_max_block_size(mut self, max: u16) -> Self {
        self.max_block_size = max;
        self
    }

    pub fn with_carrier(mut self, carrier: Carrier) -> Self {
        self.default_carrier = carrier;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn with_inbound_buffer_frames(mut self, frames: usize) -> Self {
        self.inbound_buffer_frames = frames;
        self
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Resolve a requested block size, where 0 means the default
    pub fn block_size_or_default(&self, requested: u16) -> u16 {
        if requested == 0 {
            self.default_block_size
        } else {
            requested
        }
    }

    /// Check the settings for values the multiplexer cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_block_size == 0 {
            return Err(ConfigError::Invalid("default_block_size must be non-zero".into()));
        }
        if self.default_block_size > self.max_block_size {
            return Err(ConfigError::Invalid(format!(
                "default_block_size {} exceeds max_block_size {}",
                self.default_block_size, self.max_block_size
            )));
        }
        if self.open_timeout_ms == 0 {
            return Err(ConfigError::Invalid("open_timeout_ms must be non-zero".into()));
        }
        if self.inbound_buffer_frames == 0 {
            return Err(ConfigError::Invalid("inbound_buffer_frames must be non-zero".into()));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IbbConfig::default();
        assert_eq!(config.default_block_size, protocol::DEFAULT_BLOCK_SIZE);
        assert_eq!(config.default_carrier, Carrier::Iq);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = IbbConfig::new()
            .with_block_size(10)
            .with_carrier(Carrier::Message)
            .with_open_timeout(Duration::from_secs(5))
            .with_accept_backlog(0);

        assert_eq!(config.default_block_size, 10);
        assert_eq!(config.default_carrier, Carrier::Message);
        assert_eq!(config.open_timeout(), Duration::from_secs(5));
        assert_eq!(config.accept_backlog, 0);
    }

    #[test]
    fn test_sub_second_open_timeout_is_kept() {
        let config = IbbConfig::new().with_open_timeout(Duration::from_millis(500));
        assert_eq!(config.open_timeout_ms, 500);
        assert_eq!(config.open_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());

        let config = IbbConfig::new().with_open_timeout(Duration::from_micros(10));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_block_size_means_default() {
        let config = IbbConfig::new().with_block_size(512);
        assert_eq!(config.block_size_or_default(0), 512);
        assert_eq!(config.block_size_or_default(64), 64);
    }

    #[test]
    fn test_validate_rejects_oversized_default() {
        let config = IbbConfig::new().with_block_size(8192).with_max_block_size(4096);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(IbbConfig::new().with_block_size(0).validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: IbbConfig = toml::from_str("default_block_size = 1024\ndefault_carrier = \"message\"\n").unwrap();
        assert_eq!(config.default_block_size, 1024);
        assert_eq!(config.default_carrier, Carrier::Message);
        assert_eq!(config.accept_backlog, protocol::ACCEPT_BACKLOG);
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let path = std::env::temp_dir().join(format!("ibb-config-{}.toml", std::process::id()));
        let config = IbbConfig::new().with_block_size(2048);
        config.to_file(&path).unwrap();
        let loaded = IbbConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
