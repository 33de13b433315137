//! Client configuration
//!
//! Holds the constants that the peer and tracker machinery reads at
//! runtime: block size, request batching, message limits, listen port and
//! the advertised protocol extensions.

use std::path::PathBuf;

use anyhow::Result;

use crate::error::TorrentError;
use crate::protocol::Extensions;

/// Immutable configuration of the client
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes requested per block (last block of a piece may be shorter)
    pub block_length: usize,
    /// Number of Request messages sent back-to-back in one batch
    pub request_per_call: usize,
    /// Maximum accepted peer message length in bytes
    pub max_message_length: usize,
    /// Listen port for incoming peers, also reported to trackers
    pub port: u16,
    /// Protocol extensions advertised in the handshake reserved bytes
    pub extensions: Extensions,
    /// Directory the working file and the extracted download land in
    pub output_dir: PathBuf,
}

impl Config {
    /// Default block length (16 KiB)
    pub const DEFAULT_BLOCK_LENGTH: usize = 1 << 14;
    /// Default request batch size
    pub const DEFAULT_REQUEST_PER_CALL: usize = 6;
    /// Default maximum message length (128 KiB)
    pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1 << 17;
    /// Default listen port
    pub const DEFAULT_PORT: u16 = 6881;

    /// Create the configuration the client ships with
    pub fn new() -> Self {
        Self {
            block_length: Self::DEFAULT_BLOCK_LENGTH,
            request_per_call: Self::DEFAULT_REQUEST_PER_CALL,
            max_message_length: Self::DEFAULT_MAX_MESSAGE_LENGTH,
            port: Self::DEFAULT_PORT,
            extensions: Extensions::default(),
            output_dir: PathBuf::from("."),
        }
    }

    /// Override the listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the request batch size
    pub fn with_request_per_call(mut self, request_per_call: usize) -> Self {
        self.request_per_call = request_per_call;
        self
    }

    /// Override the advertised extensions
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Override the output directory
    pub fn with_output_dir(mut self, output_dir: PathBuf) -> Self {
        self.output_dir = output_dir;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.block_length == 0 || self.block_length > self.max_message_length {
            return Err(TorrentError::config_error_with_field(
                "block_length must be non-zero and fit in max_message_length",
                "block_length",
            )
            .into());
        }
        if self.request_per_call == 0 {
            return Err(TorrentError::config_error_with_field(
                "request_per_call must be at least 1",
                "request_per_call",
            )
            .into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
