//! Piece store
//!
//! Owns the working file, writes incoming blocks at their piece offsets,
//! verifies finished pieces against their SHA1 hashes and, once every
//! piece checks out, extracts the final file layout. A pre-existing
//! working file is swept in parallel at startup so completed pieces
//! survive a restart.
//!
//! All file access is positional; the file never carries a shared cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;
use crate::protocol::Message;
use crate::storage::Bitfield;
use crate::torrent::Metadata;

/// Result of writing one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Block landed; the piece still has blocks outstanding
    InProgress,
    /// The block finished its piece and the SHA1 matched
    PieceComplete,
    /// The block finished its piece but the SHA1 did not match
    HashMismatch,
    /// Parameters were out of range; nothing was written
    Ignored,
}

struct StoreState {
    file: Arc<File>,
    piece_count: usize,
    piece_length: usize,
    total_length: u64,
    bitfield: Arc<Bitfield>,
}

/// Thread-safe piece store bound to one torrent
pub struct PieceStore {
    metadata: Arc<Metadata>,
    state: Mutex<Option<StoreState>>,
    running: Mutex<bool>,
    running_notify: Notify,
    /// Directory the working file and the extracted layout land in
    output_dir: PathBuf,
}

impl PieceStore {
    /// Create a store for the given torrent, writing under `output_dir`
    pub fn new(metadata: Arc<Metadata>, output_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            state: Mutex::new(None),
            running: Mutex::new(true),
            running_notify: Notify::new(),
            output_dir,
        })
    }

    /// Open and size the working file; must run after the metadata is ready
    ///
    /// Sizes the local bitfield, opens (creating if necessary) the working
    /// file, resizes it to the total length, and re-verifies a
    /// pre-existing file so finished pieces are not downloaded again. If
    /// the sweep finds the file already complete, the torrent is extracted
    /// and the store stops immediately.
    pub async fn init_file(self: &Arc<Self>) -> Result<()> {
        if !self.metadata.is_ready() {
            return Err(
                TorrentError::storage_error("init_file called before metadata is ready").into(),
            );
        }

        let piece_count = self.metadata.piece_count();
        let piece_length = self.metadata.piece_length();
        let total_length = self.metadata.total_length();
        let file_path = self.output_dir.join(self.metadata.file_name());

        let file_existed = file_path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .map_err(|e| {
                TorrentError::storage_error_full(
                    "Failed to open working file",
                    file_path.display().to_string(),
                    e.to_string(),
                )
            })?;
        // The file length from the metadata is authoritative.
        file.set_len(total_length).map_err(|e| {
            TorrentError::storage_error_full(
                "Failed to resize working file",
                file_path.display().to_string(),
                e.to_string(),
            )
        })?;

        info!(
            "Opened working file {} ({} MiB)",
            file_path.display(),
            total_length / (1024 * 1024)
        );

        let bitfield = Arc::new(Bitfield::new(piece_count.div_ceil(8)));
        let state = StoreState {
            file: Arc::new(file),
            piece_count,
            piece_length,
            total_length,
            bitfield: bitfield.clone(),
        };

        if file_existed {
            // Count pieces into the metadata while sweeping, but hold off
            // the extraction hook until the sweep has finished.
            let metadata = self.metadata.clone();
            bitfield.set_on_piece_complete(move |piece_index| {
                metadata.on_piece_complete(piece_index);
            });

            let store = self.clone();
            let sweep_state = StoreState {
                file: state.file.clone(),
                bitfield: bitfield.clone(),
                ..state
            };
            tokio::task::spawn_blocking(move || store.run_checksum_sweep(&sweep_state))
                .await
                .map_err(|e| TorrentError::storage_error(e.to_string()))?;
        }

        *self.state.lock().unwrap() = Some(state);

        if file_existed && self.metadata.is_file_complete() {
            info!("Working file is already complete");
            self.extract_torrent()?;
            self.stop();
            return Ok(());
        }

        let weak: Weak<PieceStore> = Arc::downgrade(self);
        bitfield.set_on_piece_complete(move |piece_index| {
            if let Some(store) = weak.upgrade() {
                store.on_piece_done(piece_index);
            }
        });

        Ok(())
    }

    /// The shared local bitfield, once the file is initialized
    pub fn bitfield(&self) -> Option<Arc<Bitfield>> {
        self.state.lock().unwrap().as_ref().map(|s| s.bitfield.clone())
    }

    /// Whether `init_file` has run
    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Write one block at its piece offset
    ///
    /// Out-of-range parameters are ignored. When the block reaches the end
    /// of its piece the whole piece is read back and verified; the
    /// returned outcome says whether the piece is done, failed its hash,
    /// or still has blocks outstanding.
    pub async fn write_block(
        &self,
        piece_index: usize,
        begin: usize,
        block: Vec<u8>,
    ) -> Result<WriteOutcome> {
        let (file, piece_count, piece_length, total_length) = {
            let state = self.state.lock().unwrap();
            let state = state
                .as_ref()
                .ok_or_else(|| TorrentError::storage_error("write_block before init_file"))?;
            (
                state.file.clone(),
                state.piece_count,
                state.piece_length,
                state.total_length,
            )
        };

        if piece_index >= piece_count || begin > piece_length {
            warn!(
                "Ignoring block with invalid parameters (piece {}, begin {})",
                piece_index, begin
            );
            return Ok(WriteOutcome::Ignored);
        }

        let offset = piece_index as u64 * piece_length as u64 + begin as u64;
        let block_len = block.len();

        let write_file = file.clone();
        tokio::task::spawn_blocking(move || write_file.write_all_at(&block, offset))
            .await
            .map_err(|e| TorrentError::storage_error(e.to_string()))?
            .map_err(|e| {
                TorrentError::storage_error_full(
                    "Failed to write block",
                    format!("piece {}, begin {}", piece_index, begin),
                    e.to_string(),
                )
            })?;

        let actual_piece_length = Self::piece_length_at(
            piece_index,
            piece_count,
            piece_length,
            total_length,
        );
        if begin + block_len < actual_piece_length {
            return Ok(WriteOutcome::InProgress);
        }

        // Piece boundary reached: read the piece back and check the hash.
        let expected = self
            .metadata
            .piece_hash(piece_index)
            .ok_or_else(|| TorrentError::storage_error("Piece hash missing"))?;
        let verified = tokio::task::spawn_blocking(move || {
            Self::verify_piece(&file, piece_index, actual_piece_length, piece_length, expected)
        })
        .await
        .map_err(|e| TorrentError::storage_error(e.to_string()))??;

        if verified {
            debug!("Piece {} verified", piece_index);
            Ok(WriteOutcome::PieceComplete)
        } else {
            warn!("Piece {} failed SHA1 verification", piece_index);
            Ok(WriteOutcome::HashMismatch)
        }
    }

    /// Read one block and wrap it in a ready-to-send Piece message
    pub async fn read_block(
        &self,
        piece_index: usize,
        begin: usize,
        length: usize,
    ) -> Result<Message> {
        let (file, piece_count, piece_length) = {
            let state = self.state.lock().unwrap();
            let state = state
                .as_ref()
                .ok_or_else(|| TorrentError::storage_error("read_block before init_file"))?;
            (state.file.clone(), state.piece_count, state.piece_length)
        };

        if piece_index >= piece_count || begin > piece_length {
            return Err(TorrentError::storage_error(format!(
                "read_block with invalid parameters (piece {}, begin {})",
                piece_index, begin
            ))
            .into());
        }

        let offset = piece_index as u64 * piece_length as u64 + begin as u64;
        let block = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = vec![0u8; length];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| TorrentError::storage_error(e.to_string()))?
        .map_err(|e| {
            TorrentError::storage_error_full(
                "Failed to read block",
                format!("piece {}, begin {}", piece_index, begin),
                e.to_string(),
            )
        })?;

        Ok(Message::Piece {
            index: piece_index as u32,
            begin: begin as u32,
            block,
        })
    }

    /// Wait until the download has finished (or `stop` is called)
    pub async fn wait(&self) {
        loop {
            let notified = self.running_notify.notified();
            tokio::pin!(notified);
            // Register before checking, or a wake between the check and
            // the await would be lost.
            notified.as_mut().enable();
            if !*self.running.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }

    /// Release all waiters
    pub fn stop(&self) {
        *self.running.lock().unwrap() = false;
        self.running_notify.notify_waiters();
    }

    /// Piece completion hook: update the metadata and finish up when the
    /// last piece lands
    fn on_piece_done(&self, piece_index: usize) {
        self.metadata.on_piece_complete(piece_index);
        if !self.metadata.is_file_complete() {
            return;
        }
        info!("Download complete, extracting");
        if let Err(e) = self.extract_torrent() {
            error!("Extraction failed: {}", e);
        }
        self.stop();
    }

    /// Length of a specific piece (the last one may be shorter)
    fn piece_length_at(
        piece_index: usize,
        piece_count: usize,
        piece_length: usize,
        total_length: u64,
    ) -> usize {
        if piece_index == piece_count - 1 {
            (total_length - piece_index as u64 * piece_length as u64) as usize
        } else {
            piece_length
        }
    }

    /// Read a piece back from disk and compare its SHA1
    fn verify_piece(
        file: &File,
        piece_index: usize,
        actual_piece_length: usize,
        piece_length: usize,
        expected: [u8; 20],
    ) -> Result<bool> {
        let mut buf = vec![0u8; actual_piece_length];
        file.read_exact_at(&mut buf, piece_index as u64 * piece_length as u64)
            .map_err(|e| {
                TorrentError::storage_error_full(
                    "Failed to read piece for verification",
                    format!("piece {}", piece_index),
                    e.to_string(),
                )
            })?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash: [u8; 20] = hasher.finalize().into();
        Ok(hash == expected)
    }

    /// Verify every piece of a pre-existing working file in parallel
    ///
    /// The piece ranges are disjoint, so the workers never touch the same
    /// bytes; results merge through the shared bitfield.
    fn run_checksum_sweep(&self, state: &StoreState) {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pieces_per_worker = state.piece_count / worker_count;

        info!(
            "Re-verifying existing working file with {} workers",
            worker_count
        );
        let started = std::time::Instant::now();

        std::thread::scope(|scope| {
            for worker in 0..worker_count {
                let start = worker * pieces_per_worker;
                let end = if worker == worker_count - 1 {
                    state.piece_count
                } else {
                    start + pieces_per_worker
                };
                let metadata = &self.metadata;
                let file = &state.file;
                let bitfield = &state.bitfield;
                let piece_count = state.piece_count;
                let piece_length = state.piece_length;
                let total_length = state.total_length;

                scope.spawn(move || {
                    for piece_index in start..end {
                        let actual = Self::piece_length_at(
                            piece_index,
                            piece_count,
                            piece_length,
                            total_length,
                        );
                        let expected = match metadata.piece_hash(piece_index) {
                            Some(hash) => hash,
                            None => continue,
                        };
                        match Self::verify_piece(file, piece_index, actual, piece_length, expected)
                        {
                            Ok(true) => bitfield.set_piece(piece_index),
                            Ok(false) => {}
                            Err(e) => {
                                error!("Sweep failed on piece {}: {}", piece_index, e);
                            }
                        }
                    }
                });
            }
        });

        info!(
            "Checksum sweep finished in {:?}: {}/{} pieces valid",
            started.elapsed(),
            self.metadata.pieces_done(),
            state.piece_count
        );
    }

    /// Write one extracted file from its slice of the working file
    fn extract_file(&self, file: &File, offset: u64, length: u64, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TorrentError::storage_error_full(
                        "Failed to create output directory",
                        parent.display().to_string(),
                        e.to_string(),
                    )
                })?;
            }
        }

        let output = File::create(path).map_err(|e| {
            TorrentError::storage_error_full(
                "Failed to create output file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;

        const CHUNK: usize = 1 << 20;
        let mut buf = vec![0u8; CHUNK];
        let mut copied: u64 = 0;
        while copied < length {
            let step = std::cmp::min(CHUNK as u64, length - copied) as usize;
            file.read_exact_at(&mut buf[..step], offset + copied)?;
            output.write_all_at(&buf[..step], copied)?;
            copied += step as u64;
        }

        info!("Extracted {} ({} bytes)", path.display(), length);
        Ok(())
    }

    /// Turn the contiguous working file into the torrent's file layout
    fn extract_torrent(&self) -> Result<()> {
        let file = {
            let state = self.state.lock().unwrap();
            state
                .as_ref()
                .ok_or_else(|| TorrentError::storage_error("extract before init_file"))?
                .file
                .clone()
        };

        let files = self.metadata.files();
        if files.len() == 1 {
            let (length, path) = &files[0];
            return self.extract_file(&file, 0, *length, &self.output_dir.join(path));
        }

        let folder = self.output_dir.join(self.metadata.name());
        std::fs::create_dir_all(&folder).map_err(|e| {
            TorrentError::storage_error_full(
                "Failed to create torrent directory",
                folder.display().to_string(),
                e.to_string(),
            )
        })?;

        let mut offset: u64 = 0;
        for (length, path) in files {
            self.extract_file(&file, offset, length, &folder.join(&path))?;
            offset += length;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("initialized", &self.is_initialized())
            .field("running", &*self.running.lock().unwrap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a single-file torrent whose piece hashes match `content`
    fn torrent_for_content(name: &str, content: &[u8], piece_length: usize) -> Vec<u8> {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            pieces.extend_from_slice(&hasher.finalize());
        }
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce18:http://t.example/a4:infod");
        out.extend_from_slice(format!("6:lengthi{}e", content.len()).as_bytes());
        out.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        out.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
        out.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        out.extend_from_slice(&pieces);
        out.extend_from_slice(b"ee");
        out
    }

    fn metadata_for(dir: &Path, name: &str, content: &[u8], piece_length: usize) -> Arc<Metadata> {
        let torrent = torrent_for_content(name, content, piece_length);
        let path = dir.join(format!("{}.torrent", name));
        let mut file = File::create(&path).unwrap();
        file.write_all(&torrent).unwrap();
        Arc::new(Metadata::from_torrent_file(&path).unwrap())
    }

    #[tokio::test]
    async fn test_init_creates_sized_file() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; 1000];
        let metadata = metadata_for(dir.path(), "sized", &content, 512);
        let store = PieceStore::new(metadata, dir.path().to_path_buf());

        store.init_file().await.unwrap();

        let working = dir.path().join("sized.tmp");
        assert_eq!(std::fs::metadata(&working).unwrap().len(), 1000);
        assert_eq!(store.bitfield().unwrap().len(), 1); // ceil(2/8)
    }

    #[tokio::test]
    async fn test_write_blocks_verifies_piece() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let metadata = metadata_for(dir.path(), "verify", &content, 512);
        let store = PieceStore::new(metadata.clone(), dir.path().to_path_buf());
        store.init_file().await.unwrap();

        // First piece in two half-blocks.
        let outcome = store
            .write_block(0, 0, content[0..256].to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::InProgress);
        let outcome = store
            .write_block(0, 256, content[256..512].to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::PieceComplete);
    }

    #[tokio::test]
    async fn test_write_corrupt_piece_reports_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![1u8; 512];
        let metadata = metadata_for(dir.path(), "corrupt", &content, 512);
        let store = PieceStore::new(metadata, dir.path().to_path_buf());
        store.init_file().await.unwrap();

        let outcome = store.write_block(0, 0, vec![2u8; 512]).await.unwrap();
        assert_eq!(outcome, WriteOutcome::HashMismatch);
    }

    #[tokio::test]
    async fn test_invalid_parameters_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![1u8; 512];
        let metadata = metadata_for(dir.path(), "ignored", &content, 512);
        let store = PieceStore::new(metadata, dir.path().to_path_buf());
        store.init_file().await.unwrap();

        let outcome = store.write_block(9, 0, vec![0u8; 16]).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Ignored);
        let outcome = store.write_block(0, 4096, vec![0u8; 16]).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_read_block_builds_piece_message() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        let metadata = metadata_for(dir.path(), "serve", &content, 512);
        let store = PieceStore::new(metadata, dir.path().to_path_buf());
        store.init_file().await.unwrap();

        store.write_block(0, 0, content.clone()).await.unwrap();
        let message = store.read_block(0, 128, 64).await.unwrap();
        assert_eq!(
            message,
            Message::Piece {
                index: 0,
                begin: 128,
                block: content[128..192].to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_marks_existing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..2048u32).map(|i| (i % 199) as u8).collect();
        let metadata = metadata_for(dir.path(), "resume", &content, 512);

        // A previous run left the first half of the file valid.
        let working = dir.path().join("resume.tmp");
        let mut partial = content.clone();
        partial[1024..].fill(0);
        std::fs::write(&working, &partial).unwrap();

        let store = PieceStore::new(metadata.clone(), dir.path().to_path_buf());
        store.init_file().await.unwrap();

        assert_eq!(metadata.pieces_done(), 2);
        let bitfield = store.bitfield().unwrap();
        assert!(bitfield.has_piece(0));
        assert!(bitfield.has_piece(1));
        assert!(!bitfield.has_piece(2));
        assert!(!bitfield.has_piece(3));
        assert_eq!(metadata.left(), 1024);
    }

    #[tokio::test]
    async fn test_complete_file_extracts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 127) as u8).collect();
        let metadata = metadata_for(dir.path(), "done", &content, 512);

        std::fs::write(dir.path().join("done.tmp"), &content).unwrap();

        let store = PieceStore::new(metadata.clone(), dir.path().to_path_buf());
        store.init_file().await.unwrap();

        assert!(metadata.is_file_complete());
        let extracted = std::fs::read(dir.path().join("done")).unwrap();
        assert_eq!(extracted, content);

        // wait() returns immediately once stopped.
        tokio::time::timeout(std::time::Duration::from_secs(1), store.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_completing_last_piece_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..700u32).map(|i| (i % 97) as u8).collect();
        let metadata = metadata_for(dir.path(), "finish", &content, 512);
        let store = PieceStore::new(metadata.clone(), dir.path().to_path_buf());
        store.init_file().await.unwrap();

        let bitfield = store.bitfield().unwrap();
        let peer_bits = Bitfield::from_bytes(vec![0xFF]);

        // Download both pieces the way a peer would: reserve, write, report.
        let first = bitfield.assign_piece(&peer_bits).unwrap();
        let outcome = store
            .write_block(first, 0, content[..512].to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::PieceComplete);
        bitfield.piece_success(Some(first));

        let second = bitfield.assign_piece(&peer_bits).unwrap();
        let outcome = store
            .write_block(second, 0, content[512..].to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::PieceComplete);
        bitfield.piece_success(Some(second));

        assert!(metadata.is_file_complete());
        assert_eq!(metadata.left(), 0);
        let extracted = std::fs::read(dir.path().join("finish")).unwrap();
        assert_eq!(extracted, content);

        tokio::time::timeout(std::time::Duration::from_secs(1), store.wait())
            .await
            .unwrap();
    }
}
