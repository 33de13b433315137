//! Thread-safe torrent bitfield
//!
//! Packed bits, most significant bit first: bit `i` lives in byte `i / 8`
//! under mask `1 << (7 - i % 8)`. One shared instance tracks our own
//! pieces across all peers; each peer additionally holds a plain copy of
//! the remote side's field.
//!
//! Piece reservation is optimistic: `assign_piece` flips the local bit so
//! no other peer picks the same piece, `piece_failed` flips it back, and
//! `piece_success` leaves it set and fires the completion hook.

use std::sync::Mutex;

use tracing::error;

use crate::protocol::Message;

type PieceHook = Box<dyn Fn(usize) + Send + Sync>;

/// A thread-safe bit set over torrent pieces
pub struct Bitfield {
    bits: Mutex<Vec<u8>>,
    on_piece_complete: Mutex<Option<PieceHook>>,
}

impl Bitfield {
    /// Create an all-zero bitfield of `size` bytes (holds `size * 8` bits)
    pub fn new(size: usize) -> Self {
        Self {
            bits: Mutex::new(vec![0u8; size]),
            on_piece_complete: Mutex::new(None),
        }
    }

    /// Create a bitfield from received bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bits: Mutex::new(bytes),
            on_piece_complete: Mutex::new(None),
        }
    }

    /// Size of the inner buffer in bytes
    pub fn len(&self) -> usize {
        self.bits.lock().unwrap().len()
    }

    /// Whether the bitfield holds zero bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.lock().unwrap().clone()
    }

    /// The bitfield as a ready-to-send peer message
    pub fn as_message(&self) -> Message {
        Message::Bitfield {
            bitfield: self.to_bytes(),
        }
    }

    /// Whether the bit at `piece_index` is set
    ///
    /// Reads past the end return false.
    pub fn has_piece(&self, piece_index: usize) -> bool {
        let bits = self.bits.lock().unwrap();
        if piece_index / 8 >= bits.len() {
            error!("Bitfield::has_piece index {} out of range", piece_index);
            return false;
        }
        has_piece_unlocked(&bits, piece_index)
    }

    /// Set the bit at `piece_index`
    ///
    /// Fires the completion hook if the bit was not already set. Writes
    /// past the end are no-ops.
    pub fn set_piece(&self, piece_index: usize) {
        {
            let mut bits = self.bits.lock().unwrap();
            if piece_index / 8 >= bits.len() {
                error!("Bitfield::set_piece index {} out of range", piece_index);
                return;
            }
            if has_piece_unlocked(&bits, piece_index) {
                return;
            }
            set_piece_unlocked(&mut bits, piece_index, true);
        }
        // The hook runs outside the lock: it typically takes other
        // subsystem locks (metadata, store) of its own.
        self.fire_on_piece_complete(piece_index);
    }

    /// Atomically reserve the first piece we lack and the peer has
    ///
    /// The local bit is flipped before returning so no other peer can be
    /// assigned the same index. Returns None when nothing matches. The
    /// first-fit scan is the seam a rarest-first picker would replace.
    pub fn assign_piece(&self, peer_bitfield: &Bitfield) -> Option<usize> {
        let mut bits = self.bits.lock().unwrap();
        let peer_bits = peer_bitfield.bits.lock().unwrap();

        if bits.len() != peer_bits.len() {
            error!(
                "Bitfield::assign_piece size mismatch ({} vs {} bytes)",
                bits.len(),
                peer_bits.len()
            );
            return None;
        }

        for i in 0..bits.len() {
            let candidates = !bits[i] & peer_bits[i];
            if candidates == 0 {
                continue;
            }
            for j in 0..8 {
                if (candidates >> (7 - j)) & 1 != 0 {
                    bits[i] |= 1 << (7 - j);
                    return Some(i * 8 + j);
                }
            }
        }
        None
    }

    /// Report a successfully verified piece
    ///
    /// The bit stays set (it was flipped at assignment); the completion
    /// hook fires for the index.
    pub fn piece_success(&self, piece_index: Option<usize>) {
        if let Some(index) = piece_index {
            self.fire_on_piece_complete(index);
        }
    }

    /// Release a reserved piece after a failed download
    ///
    /// Clears the bit so another peer can be assigned the piece.
    pub fn piece_failed(&self, piece_index: Option<usize>) {
        if let Some(index) = piece_index {
            let mut bits = self.bits.lock().unwrap();
            if index / 8 >= bits.len() {
                error!("Bitfield::piece_failed index {} out of range", index);
                return;
            }
            set_piece_unlocked(&mut bits, index, false);
        }
    }

    /// Install the handler called once per completed piece
    pub fn set_on_piece_complete<F>(&self, hook: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.on_piece_complete.lock().unwrap() = Some(Box::new(hook));
    }

    fn fire_on_piece_complete(&self, piece_index: usize) {
        let hook = self.on_piece_complete.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            hook(piece_index);
        }
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("bytes", &self.len())
            .finish()
    }
}

fn has_piece_unlocked(bits: &[u8], piece_index: usize) -> bool {
    (bits[piece_index / 8] >> (7 - piece_index % 8)) & 1 != 0
}

fn set_piece_unlocked(bits: &mut [u8], piece_index: usize, value: bool) {
    let mask = 1 << (7 - piece_index % 8);
    if value {
        bits[piece_index / 8] |= mask;
    } else {
        bits[piece_index / 8] &= !mask;
    }
}
