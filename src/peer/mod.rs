//! Peers
//!
//! One task per remote peer, driving the connect/handshake/message loop
//! and the piece request pipeline, plus the manager that owns the peer
//! registry, the pre-computed handshake bytes and the accept loop.

pub mod manager;
pub mod peer;

pub use manager::PeerManager;
pub use peer::{Peer, PeerState};
