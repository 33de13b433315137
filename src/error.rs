//! Error types for the torrent client
//!
//! This module defines the error types shared by all components of the
//! client.

use std::fmt;

/// Error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode syntax errors (unexpected byte, truncated value, ...)
    InvalidBencode {
        message: String,
        position: Option<usize>,
    },

    /// Torrent file / magnet URI parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// BitTorrent wire protocol errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// File I/O and storage errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        announce: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new InvalidBencode error
    pub fn invalid_bencode(message: impl Into<String>) -> Self {
        TorrentError::InvalidBencode {
            message: message.into(),
            position: None,
        }
    }

    /// Create a new InvalidBencode error with the offending byte position
    pub fn invalid_bencode_at(message: impl Into<String>, position: usize) -> Self {
        TorrentError::InvalidBencode {
            message: message.into(),
            position: Some(position),
        }
    }

    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            announce: None,
            source: None,
        }
    }

    /// Create a new TrackerError with announce URL
    pub fn tracker_error_with_announce(
        message: impl Into<String>,
        announce: impl Into<String>,
    ) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            announce: Some(announce.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with announce URL and source
    pub fn tracker_error_full(
        message: impl Into<String>,
        announce: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            announce: Some(announce.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(
        message: impl Into<String>,
        address: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(
        message: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::InvalidBencode { message, position } => {
                if let Some(pos) = position {
                    write!(f, "Invalid bencode: {} (at byte {})", message, pos)
                } else {
                    write!(f, "Invalid bencode: {}", message)
                }
            }
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::PeerError {
                message,
                peer,
                source,
            } => match (peer, source) {
                (Some(p), Some(s)) => {
                    write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s)
                }
                (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                (None, None) => write!(f, "Peer error: {}", message),
            },
            TorrentError::StorageError {
                message,
                path,
                source,
            } => match (path, source) {
                (Some(p), Some(s)) => {
                    write!(f, "Storage error: {} (path: {}, source: {})", message, p, s)
                }
                (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                (None, None) => write!(f, "Storage error: {}", message),
            },
            TorrentError::TrackerError {
                message,
                announce,
                source,
            } => match (announce, source) {
                (Some(a), Some(s)) => write!(
                    f,
                    "Tracker error: {} (announce: {}, source: {})",
                    message, a, s
                ),
                (Some(a), None) => write!(f, "Tracker error: {} (announce: {})", message, a),
                (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                (None, None) => write!(f, "Tracker error: {}", message),
            },
            TorrentError::NetworkError {
                message,
                address,
                source,
            } => match (address, source) {
                (Some(a), Some(s)) => write!(
                    f,
                    "Network error: {} (address: {}, source: {})",
                    message, a, s
                ),
                (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                (None, None) => write!(f, "Network error: {}", message),
            },
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(
            err.to_string(),
            "unknown".to_string(),
            err.kind().to_string(),
        )
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full(
            "Failed to parse address",
            "unknown".to_string(),
            err.to_string(),
        )
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::parse_error_with_source("Failed to parse URL", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}
