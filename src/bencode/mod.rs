//! Bencode codec
//!
//! The serialization format used by .torrent files and tracker responses.
//! Four value kinds: integer, byte string, list and dictionary. Dictionaries
//! keep their keys sorted so that re-emitting a parsed value reproduces the
//! canonical byte form (the info hash is the SHA1 of exactly that form).

mod value;

pub use value::{parse, BencodeValue};
