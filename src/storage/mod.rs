//! Piece storage
//!
//! The thread-safe bitfield that tracks and reserves pieces, and the
//! piece store that owns the working file, verifies SHA1 hashes and
//! extracts the finished download.

pub mod bitfield;
pub mod store;

pub use bitfield::Bitfield;
pub use store::{PieceStore, WriteOutcome};
