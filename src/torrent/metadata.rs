//! Shared torrent metadata
//!
//! One instance per torrent, shared by the piece store, peers and
//! trackers. A .torrent file fills it completely at construction; a
//! magnet link only seeds the info hash and trackers, and the rest
//! arrives later through `load_info` (BEP9 metadata exchange). The
//! `ready` latch tells everyone when the info dictionary is known.
//!
//! All fields live under one mutex; accessors take it for reads too.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bencode::{self, BencodeValue};
use crate::error::TorrentError;
use crate::torrent::magnet::MagnetLink;

/// Block size used for piece requests (16 KiB)
pub const BLOCK_LENGTH: usize = 1 << 14;

#[derive(Debug, Default)]
struct MetadataState {
    info_hash: [u8; 20],
    trackers: Vec<String>,

    /// Name of the torrent
    name: String,
    /// Name of the working file written during the download
    file_name: String,
    piece_length: usize,
    total_length: u64,
    /// (length, relative path) per file; one entry for single-file torrents
    files: Vec<(u64, String)>,

    /// Concatenated 20-byte piece hashes
    pieces: Vec<u8>,

    downloaded: u64,
    uploaded: u64,
    left: u64,
    pieces_done: usize,

    ready: bool,
}

type ReadyHook = Box<dyn FnOnce() + Send>;

/// Thread-safe torrent metadata with a ready latch
pub struct Metadata {
    state: Mutex<MetadataState>,
    ready_notify: Notify,
    on_ready: Mutex<Option<ReadyHook>>,
}

impl Metadata {
    fn empty() -> Self {
        Self {
            state: Mutex::new(MetadataState::default()),
            ready_notify: Notify::new(),
            on_ready: Mutex::new(None),
        }
    }

    /// Create metadata from either a .torrent file path or a magnet URI
    pub fn create(torrent: &str) -> Result<Self> {
        if MagnetLink::is_magnet(torrent) {
            Self::from_magnet(torrent)
        } else {
            Self::from_torrent_file(Path::new(torrent))
        }
    }

    /// Create metadata from a .torrent file
    ///
    /// The metadata is ready to use afterwards.
    pub fn from_torrent_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            TorrentError::storage_error_full(
                "Failed to read torrent file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;

        let root = bencode::parse(&data)?;
        info!("Parsed torrent file {}", path.display());
        debug!("Torrent file contents: {}", root.to_json());

        let metadata = Self::empty();

        // Tracker discovery: a plain announce key wins; otherwise the
        // announce-list tiers are flattened. url-list (BEP19) torrents are
        // rejected until web seeding exists.
        let trackers = if let Some(announce) = root.get(b"announce") {
            let announce = announce.as_str_lossy().ok_or_else(|| {
                TorrentError::parse_error("announce key is not a string")
            })?;
            vec![announce]
        } else if let Some(announce_list) = root.get(b"announce-list") {
            let tiers = announce_list.as_list().ok_or_else(|| {
                TorrentError::parse_error("announce-list is not a list")
            })?;
            let mut trackers = Vec::new();
            for tier in tiers {
                for entry in tier.as_list().unwrap_or(&[]) {
                    if let Some(url) = entry.as_str_lossy() {
                        trackers.push(url);
                    }
                }
            }
            trackers
        } else if root.get(b"url-list").is_some() {
            return Err(
                TorrentError::parse_error("url-list (web seed) torrents are not supported").into(),
            );
        } else {
            return Err(TorrentError::parse_error(
                "Torrent file carries neither announce nor announce-list",
            )
            .into());
        };
        metadata.state.lock().unwrap().trackers = trackers;

        let info = root
            .get(b"info")
            .ok_or_else(|| TorrentError::parse_error("Torrent file has no info dictionary"))?;
        let info_hash = Self::info_hash_of(info);

        metadata.load_info(info, info_hash)?;
        Ok(metadata)
    }

    /// Create metadata from a magnet URI
    ///
    /// The metadata is NOT ready afterwards; `load_info` must be called
    /// with the info dictionary fetched from peers.
    pub fn from_magnet(magnet_uri: &str) -> Result<Self> {
        let link = MagnetLink::parse(magnet_uri)?;
        let metadata = Self::empty();

        {
            let mut state = metadata.state.lock().unwrap();
            state.info_hash = link.info_hash;
            state.trackers = link.trackers;
            if let Some(name) = link.display_name {
                state.file_name = format!("{}.tmp", name);
                state.name = name;
            }
            if let Some(length) = link.total_length {
                state.total_length = length;
                state.left = length;
            }
        }

        Ok(metadata)
    }

    /// SHA1 of the canonical bencoded form of the info dictionary
    pub fn info_hash_of(info: &BencodeValue) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info.emit());
        hasher.finalize().into()
    }

    /// Load the info dictionary into this metadata
    ///
    /// Validates that the dictionary hashes to `info_hash`, populates the
    /// fields, latches `ready` and fires the on-ready hook.
    pub fn load_info(&self, info: &BencodeValue, info_hash: [u8; 20]) -> Result<()> {
        if Self::info_hash_of(info) != info_hash {
            return Err(TorrentError::validation_error(
                "Info dictionary does not hash to the expected info hash",
            )
            .into());
        }

        let name = info
            .get(b"name")
            .and_then(|v| v.as_str_lossy())
            .ok_or_else(|| TorrentError::parse_error("Info dictionary has no name"))?;
        let piece_length = info
            .get(b"piece length")
            .and_then(|v| v.as_int())
            .ok_or_else(|| TorrentError::parse_error("Info dictionary has no piece length"))?;
        let pieces = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| TorrentError::parse_error("Info dictionary has no pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "pieces length {} is not a multiple of 20",
                pieces.len()
            ))
            .into());
        }

        // Either a flat length (single file) or a files list.
        let mut files = Vec::new();
        let mut total_length: u64 = 0;
        if let Some(file_list) = info.get(b"files") {
            let file_list = file_list
                .as_list()
                .ok_or_else(|| TorrentError::parse_error("files key is not a list"))?;
            for entry in file_list {
                let length = entry
                    .get(b"length")
                    .and_then(|v| v.as_int())
                    .ok_or_else(|| TorrentError::parse_error("File entry has no length"))?
                    as u64;
                let components = entry
                    .get(b"path")
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| TorrentError::parse_error("File entry has no path"))?;
                let path = components
                    .iter()
                    .filter_map(|c| c.as_str_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((length, path));
                total_length += length;
            }
            if files.is_empty() {
                return Err(TorrentError::parse_error("files list is empty").into());
            }
        } else {
            let length = info
                .get(b"length")
                .and_then(|v| v.as_int())
                .ok_or_else(|| {
                    TorrentError::parse_error("Info dictionary has neither length nor files")
                })? as u64;
            total_length = length;
            files.push((length, name.clone()));
        }

        {
            let mut state = self.state.lock().unwrap();
            state.info_hash = info_hash;
            state.file_name = format!("{}.tmp", name);
            state.name = name;
            state.piece_length = piece_length as usize;
            state.total_length = total_length;
            state.files = files;
            state.pieces = pieces.to_vec();
            state.left = total_length;
            state.ready = true;
        }

        debug!(
            "Metadata loaded: {} ({} bytes, {} pieces of {})",
            self.name(),
            total_length,
            pieces.len() / 20,
            piece_length
        );

        self.ready_notify.notify_waiters();
        let hook = self.on_ready.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Register a callback fired once all information needed to start the
    /// download is known
    ///
    /// Runs immediately when the metadata is already ready.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ready = self.state.lock().unwrap().ready;
        if ready {
            callback();
        } else {
            *self.on_ready.lock().unwrap() = Some(Box::new(callback));
        }
    }

    /// Wait until the metadata is ready (or released by `stop`)
    pub async fn wait(&self) {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            // Register before checking, or a wake between the check and
            // the await would be lost.
            notified.as_mut().enable();
            if self.state.lock().unwrap().ready {
                return;
            }
            notified.await;
        }
    }

    /// Wake all waiters and latch ready so they stay released
    pub fn stop(&self) {
        self.state.lock().unwrap().ready = true;
        self.ready_notify.notify_waiters();
    }

    /// Whether the info dictionary is known
    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    /// Record a completed piece
    ///
    /// Increments `pieces_done` and reduces `left` by the piece length;
    /// the last piece of the file contributes only the remainder.
    pub fn on_piece_complete(&self, piece_index: usize) {
        let mut state = self.state.lock().unwrap();
        let piece_count = state.pieces.len() / 20;
        state.pieces_done += 1;
        let contribution = if piece_index == piece_count.saturating_sub(1) {
            state.total_length - (piece_count as u64 - 1) * state.piece_length as u64
        } else {
            state.piece_length as u64
        };
        state.left = state.left.saturating_sub(contribution);
    }

    /// Add to the downloaded byte counter
    pub fn increase_downloaded(&self, bytes: u64) {
        self.state.lock().unwrap().downloaded += bytes;
    }

    /// Add to the uploaded byte counter
    pub fn increase_uploaded(&self, bytes: u64) {
        self.state.lock().unwrap().uploaded += bytes;
    }

    /// Whether every piece has been verified
    pub fn is_file_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.piece_length == 0 {
            return false;
        }
        let piece_count = (state.total_length as usize).div_ceil(state.piece_length);
        piece_count == state.pieces_done
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.state.lock().unwrap().info_hash
    }

    pub fn trackers(&self) -> Vec<String> {
        self.state.lock().unwrap().trackers.clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn file_name(&self) -> String {
        self.state.lock().unwrap().file_name.clone()
    }

    pub fn piece_length(&self) -> usize {
        self.state.lock().unwrap().piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.state.lock().unwrap().total_length
    }

    /// (length, relative path) pairs in torrent order
    pub fn files(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().files.clone()
    }

    /// The concatenated piece hashes
    pub fn pieces(&self) -> Vec<u8> {
        self.state.lock().unwrap().pieces.clone()
    }

    /// Expected SHA1 of the given piece
    pub fn piece_hash(&self, piece_index: usize) -> Option<[u8; 20]> {
        let state = self.state.lock().unwrap();
        let start = piece_index * 20;
        if start + 20 > state.pieces.len() {
            warn!("piece_hash index {} out of range", piece_index);
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&state.pieces[start..start + 20]);
        Some(hash)
    }

    pub fn piece_count(&self) -> usize {
        self.state.lock().unwrap().pieces.len() / 20
    }

    pub fn pieces_done(&self) -> usize {
        self.state.lock().unwrap().pieces_done
    }

    pub fn downloaded(&self) -> u64 {
        self.state.lock().unwrap().downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.state.lock().unwrap().uploaded
    }

    pub fn left(&self) -> u64 {
        self.state.lock().unwrap().left
    }

    /// Number of full blocks per piece
    pub fn block_count(&self) -> usize {
        self.state.lock().unwrap().piece_length / BLOCK_LENGTH
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Metadata")
            .field("info_hash", &hex::encode(state.info_hash))
            .field("name", &state.name)
            .field("trackers", &state.trackers.len())
            .field("piece_length", &state.piece_length)
            .field("total_length", &state.total_length)
            .field("pieces_done", &state.pieces_done)
            .field("ready", &state.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn single_file_torrent() -> Vec<u8> {
        b"d8:announce26:http://tracker.example.com4:infod6:lengthi16384e4:name4:test12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAAee".to_vec()
    }

    fn write_temp_torrent(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_from_torrent_file_single() {
        let file = write_temp_torrent(&single_file_torrent());
        let metadata = Metadata::from_torrent_file(file.path()).unwrap();

        assert!(metadata.is_ready());
        assert_eq!(metadata.name(), "test");
        assert_eq!(metadata.file_name(), "test.tmp");
        assert_eq!(metadata.piece_length(), 16384);
        assert_eq!(metadata.total_length(), 16384);
        assert_eq!(metadata.piece_count(), 1);
        assert_eq!(metadata.piece_hash(0), Some([b'A'; 20]));
        assert_eq!(metadata.left(), 16384);
        assert_eq!(metadata.files(), vec![(16384, "test".to_string())]);
        assert_eq!(
            metadata.trackers(),
            vec!["http://tracker.example.com".to_string()]
        );
    }

    #[test]
    fn test_info_hash_stability() {
        let file = write_temp_torrent(&single_file_torrent());
        let metadata = Metadata::from_torrent_file(file.path()).unwrap();

        // Recompute the hash over the canonical re-emitted info dictionary.
        let root = bencode::parse(&single_file_torrent()).unwrap();
        let info = root.get(b"info").unwrap();
        assert_eq!(metadata.info_hash(), Metadata::info_hash_of(info));
    }

    #[test]
    fn test_announce_list_flattened() {
        let data = b"d13:announce-listll17:udp://a.example:1el18:http://b.example/aee4:infod6:lengthi16384e4:name4:test12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let file = write_temp_torrent(data);
        let metadata = Metadata::from_torrent_file(file.path()).unwrap();
        assert_eq!(
            metadata.trackers(),
            vec![
                "udp://a.example:1".to_string(),
                "http://b.example/a".to_string()
            ]
        );
    }

    #[test]
    fn test_url_list_rejected() {
        let data = b"d8:url-listl19:http://seed.examplee4:infod6:lengthi16384e4:name4:test12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let file = write_temp_torrent(data);
        assert!(Metadata::from_torrent_file(file.path()).is_err());
    }

    #[test]
    fn test_multi_file_torrent() {
        let data = b"d8:announce26:http://tracker.example.com4:infod5:filesld6:lengthi500e4:pathl4:docs5:a.txteed6:lengthi524e4:pathl5:b.txteee4:name5:multi12:piece lengthi512e6:pieces40:AAAAAAAAAAAAAAAAAAAABBBBBBBBBBBBBBBBBBBBee";
        let file = write_temp_torrent(data);
        let metadata = Metadata::from_torrent_file(file.path()).unwrap();

        assert_eq!(metadata.total_length(), 1024);
        assert_eq!(
            metadata.files(),
            vec![(500, "docs/a.txt".to_string()), (524, "b.txt".to_string())]
        );
        assert_eq!(metadata.piece_count(), 2);
    }

    #[test]
    fn test_from_magnet_not_ready() {
        let metadata = Metadata::from_magnet(
            "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=bunny&xl=1000&tr=udp%3A%2F%2Ft.example%3A6969",
        )
        .unwrap();

        assert!(!metadata.is_ready());
        assert_eq!(metadata.name(), "bunny");
        assert_eq!(metadata.file_name(), "bunny.tmp");
        assert_eq!(metadata.total_length(), 1000);
        assert_eq!(metadata.left(), 1000);
        assert_eq!(metadata.trackers(), vec!["udp://t.example:6969".to_string()]);
        assert_eq!(metadata.piece_count(), 0);
    }

    #[test]
    fn test_load_info_validates_hash() {
        let metadata = Metadata::from_magnet(
            "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c",
        )
        .unwrap();

        let root = bencode::parse(&single_file_torrent()).unwrap();
        let info = root.get(b"info").unwrap();

        // Wrong hash is rejected, correct hash latches ready.
        assert!(metadata.load_info(info, [0u8; 20]).is_err());
        assert!(!metadata.is_ready());

        let info_hash = Metadata::info_hash_of(info);
        metadata.load_info(info, info_hash).unwrap();
        assert!(metadata.is_ready());
        assert_eq!(metadata.name(), "test");
    }

    #[test]
    fn test_on_ready_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let metadata = Metadata::from_magnet(
            "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c",
        )
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let hook_counter = counter.clone();
        metadata.on_ready(move || {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let root = bencode::parse(&single_file_torrent()).unwrap();
        let info = root.get(b"info").unwrap();
        metadata
            .load_info(info, Metadata::info_hash_of(info))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Registration after readiness runs immediately.
        let late_counter = counter.clone();
        metadata.on_ready(move || {
            late_counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_piece_accounting_short_last_piece() {
        // 3 pieces over 1500 bytes of 512-byte pieces: last piece is 476.
        let data = b"d8:announce18:http://t.example/a4:infod6:lengthi1500e4:name4:test12:piece lengthi512e6:pieces60:AAAAAAAAAAAAAAAAAAAABBBBBBBBBBBBBBBBBBBBCCCCCCCCCCCCCCCCCCCCee";
        let file = write_temp_torrent(data);
        let metadata = Metadata::from_torrent_file(file.path()).unwrap();

        assert_eq!(metadata.left(), 1500);
        metadata.on_piece_complete(0);
        assert_eq!(metadata.left(), 1500 - 512);
        metadata.on_piece_complete(2); // last piece: 1500 - 2*512 = 476
        assert_eq!(metadata.left(), 1500 - 512 - 476);
        metadata.on_piece_complete(1);
        assert_eq!(metadata.left(), 0);
        assert_eq!(metadata.pieces_done(), 3);
        assert!(metadata.is_file_complete());
    }

    #[test]
    fn test_counters() {
        let file = write_temp_torrent(&single_file_torrent());
        let metadata = Metadata::from_torrent_file(file.path()).unwrap();
        metadata.increase_downloaded(1000);
        metadata.increase_downloaded(500);
        metadata.increase_uploaded(200);
        assert_eq!(metadata.downloaded(), 1500);
        assert_eq!(metadata.uploaded(), 200);
    }

    #[tokio::test]
    async fn test_wait_released_by_stop() {
        use std::sync::Arc;

        let metadata = Arc::new(
            Metadata::from_magnet("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c")
                .unwrap(),
        );

        let waiter = metadata.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        metadata.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("wait() should be released by stop()")
            .unwrap();
    }
}
