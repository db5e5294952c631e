//! Configuration types for the JSON-RPC server

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound on handler dispatches running at once across a server
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 100;

/// Default ceiling for a single buffered JSON unit
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of handler dispatches in flight, shared by every
    /// connection the server accepts
    pub max_concurrent_calls: usize,

    /// Largest JSON unit the reader will buffer before discarding it
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroFrameLimit);
        }
        Ok(())
    }
}

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_concurrent_calls must be greater than 0")]
    ZeroConcurrency,

    #[error("max_frame_bytes must be greater than 0")]
    ZeroFrameLimit,
}
