//! BitTorrent handshake protocol
//!
//! The 68-byte handshake exchanged right after connecting, and the
//! reserved-byte extension flags (BEP10) it carries.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size in bytes
pub const HANDSHAKE_LENGTH: usize = 68;

/// Protocol extensions negotiable through the handshake reserved bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// BEP10 extension protocol (reserved bit 44)
    ExtensionProtocol,
    /// BEP9 metadata exchange, carried over the extension protocol
    MetadataExchange,
}

/// The set of extensions a client advertises
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    extension_protocol: bool,
    metadata_exchange: bool,
}

impl Extensions {
    /// An empty set (plain BitTorrent, all reserved bytes zero)
    pub fn none() -> Self {
        Self::default()
    }

    /// Enable an extension
    pub fn add(&mut self, extension: Extension) {
        match extension {
            Extension::ExtensionProtocol => self.extension_protocol = true,
            Extension::MetadataExchange => self.metadata_exchange = true,
        }
    }

    /// Disable an extension
    pub fn remove(&mut self, extension: Extension) {
        match extension {
            Extension::ExtensionProtocol => self.extension_protocol = false,
            Extension::MetadataExchange => self.metadata_exchange = false,
        }
    }

    /// Returns whether the given extension is enabled
    pub fn has(&self, extension: Extension) -> bool {
        match extension {
            Extension::ExtensionProtocol => self.extension_protocol,
            Extension::MetadataExchange => self.metadata_exchange,
        }
    }

    /// Encode the set into the handshake reserved bytes
    ///
    /// Only the extension-protocol bit has a wire representation
    /// (`reserved[5] & 0x10`); metadata exchange is negotiated later over
    /// the extension handshake itself.
    pub fn as_reserved_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        if self.extension_protocol {
            bytes[5] |= 0x10;
        }
        bytes
    }

    /// Decode the set from received handshake reserved bytes
    pub fn from_reserved_bytes(reserved: &[u8; 8]) -> Self {
        let mut extensions = Self::default();
        if reserved[5] & 0x10 != 0 {
            extensions.add(Extension::ExtensionProtocol);
        }
        extensions
    }
}

/// BitTorrent handshake message
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved bytes carrying extension bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with all reserved bytes zero
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_id: PROTOCOL_STRING.as_bytes().try_into().unwrap(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Create a new handshake advertising the given extensions
    pub fn with_extensions(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        extensions: &Extensions,
    ) -> Self {
        Self {
            protocol_id: PROTOCOL_STRING.as_bytes().try_into().unwrap(),
            reserved: extensions.as_reserved_bytes(),
            info_hash,
            peer_id,
        }
    }

    /// Generate a peer ID: the client prefix plus 12 random alphanumerics
    pub fn generate_peer_id() -> [u8; 20] {
        const PREFIX: &[u8; 8] = b"-KK1000-";
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PREFIX);
        let mut rng = rand::thread_rng();
        for byte in peer_id[8..].iter_mut() {
            *byte = rng.sample(rand::distributions::Alphanumeric);
        }
        debug!("Generated peer id: {}", String::from_utf8_lossy(&peer_id));
        peer_id
    }

    /// Serialize the handshake to its 68-byte wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Handshake too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            )
            .into());
        }

        let protocol_id: [u8; 19] = data[1..20].try_into().unwrap();
        if protocol_id != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let reserved: [u8; 8] = data[20..28].try_into().unwrap();
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            protocol_id,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake protocol string and info hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.protocol_id != PROTOCOL_STRING.as_bytes() {
            warn!("Handshake validation failed: invalid protocol identifier");
            return false;
        }

        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake validation failed: info hash mismatch (expected {}, got {})",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }

        true
    }

    /// Extensions the remote side advertised
    pub fn extensions(&self) -> Extensions {
        Extensions::from_reserved_bytes(&self.reserved)
    }
}
