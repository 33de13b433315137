//! Torrent description
//!
//! The shared, lazily-completed metadata of a torrent and the magnet URI
//! parser that seeds it when no .torrent file is available.

pub mod magnet;
pub mod metadata;

pub use magnet::MagnetLink;
pub use metadata::Metadata;
