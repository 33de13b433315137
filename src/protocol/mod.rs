//! BitTorrent peer wire protocol
//!
//! Message codec, the 68-byte handshake (with BEP10 extension bits) and
//! the length-prefixed framing used on peer sockets.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Extension, Extensions, Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
