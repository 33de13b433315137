//! undertow
//!
//! A BitTorrent client core: bencode codec, torrent/magnet metadata,
//! tracker discovery (HTTP/HTTPS/UDP), the peer wire protocol and
//! SHA1-verified piece storage.

pub mod bencode;
pub mod client;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use client::Client;
pub use config::Config;
pub use error::TorrentError;

pub use bencode::BencodeValue;
pub use peer::{PeerManager, PeerState};
pub use protocol::{Extension, Extensions, Handshake, Message, MessageId};
pub use storage::{Bitfield, PieceStore, WriteOutcome};
pub use torrent::{MagnetLink, Metadata};
pub use tracker::TrackerManager;
