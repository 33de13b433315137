//! Peer manager
//!
//! Owns the endpoint-to-peer registry, the pre-computed handshake bytes
//! and the accept loop for inbound connections. Peer tasks unregister
//! themselves when their connection ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TorrentError;
use crate::peer::Peer;
use crate::protocol::handshake::HANDSHAKE_LENGTH;
use crate::protocol::{PROTOCOL_LENGTH, PROTOCOL_STRING};
use crate::storage::PieceStore;
use crate::torrent::Metadata;

struct PeerHandle {
    task: JoinHandle<()>,
    handshook: Arc<AtomicBool>,
}

/// Registry of connected peers
pub struct PeerManager {
    config: Config,
    metadata: Arc<Metadata>,
    store: Arc<PieceStore>,

    peers: Mutex<HashMap<SocketAddr, PeerHandle>>,
    handshake: Mutex<Option<[u8; HANDSHAKE_LENGTH]>>,
    active_peers: AtomicUsize,
}

impl PeerManager {
    pub fn new(config: Config, metadata: Arc<Metadata>, store: Arc<PieceStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            metadata,
            store,
            peers: Mutex::new(HashMap::new()),
            handshake: Mutex::new(None),
            active_peers: AtomicUsize::new(0),
        })
    }

    /// Lay out the 68 handshake bytes sent to every peer
    ///
    /// Fails when either argument is not exactly 20 bytes. The extension
    /// bits come from the configuration.
    pub fn calculate_handshake(&self, info_hash: &[u8], peer_id: &[u8]) -> Result<()> {
        if info_hash.len() != 20 || peer_id.len() != 20 {
            return Err(TorrentError::validation_error(
                "info_hash and peer_id must be 20 bytes each",
            )
            .into());
        }

        let mut bytes = [0u8; HANDSHAKE_LENGTH];
        bytes[0] = PROTOCOL_LENGTH;
        bytes[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
        bytes[20..28].copy_from_slice(&self.config.extensions.as_reserved_bytes());
        bytes[28..48].copy_from_slice(info_hash);
        bytes[48..68].copy_from_slice(peer_id);

        *self.handshake.lock().unwrap() = Some(bytes);
        Ok(())
    }

    /// The pre-computed handshake, once `calculate_handshake` has run
    pub fn handshake_bytes(&self) -> Option<[u8; HANDSHAKE_LENGTH]> {
        *self.handshake.lock().unwrap()
    }

    /// Open an outbound connection to a new peer endpoint
    ///
    /// A peer already known under the same endpoint is silently ignored.
    pub fn add(self: &Arc<Self>, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(&addr) {
            return;
        }

        let handshook = Arc::new(AtomicBool::new(false));
        let manager = self.clone();
        let task_flag = handshook.clone();
        let task = tokio::spawn(async move {
            Peer::run_outbound(manager, addr, task_flag).await;
        });
        peers.insert(addr, PeerHandle { task, handshook });
        debug!("Peer count: {}, added {}", peers.len(), addr);
    }

    /// Drop the peer registered under the given endpoint
    pub fn remove(&self, addr: &SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        let Some(handle) = peers.remove(addr) else {
            return;
        };
        if handle.handshook.load(Ordering::SeqCst) {
            self.active_peers.fetch_sub(1, Ordering::SeqCst);
        }
        info!(
            "Active peers: {}, connection with {} closed",
            self.active_peers.load(Ordering::SeqCst),
            addr
        );
    }

    /// Record a completed handshake
    pub fn on_handshake(&self, addr: SocketAddr, remote_peer_id: [u8; 20]) {
        let active = self.active_peers.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Active peers: {}, handshake complete with {} ({})",
            active,
            addr,
            String::from_utf8_lossy(&remote_peer_id)
        );
    }

    /// Accept inbound peers on the configured port until stopped
    pub async fn accept_peers(self: Arc<Self>) {
        let bind_addr = format!("0.0.0.0:{}", self.config.port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Not accepting inbound peers, bind on {} failed: {}", bind_addr, e);
                return;
            }
        };
        info!("Accepting inbound peers on {}", bind_addr);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let mut peers = self.peers.lock().unwrap();
                    if peers.contains_key(&addr) {
                        continue;
                    }
                    let handshook = Arc::new(AtomicBool::new(false));
                    let manager = self.clone();
                    let task_flag = handshook.clone();
                    let task = tokio::spawn(async move {
                        Peer::run_inbound(manager, stream, addr, task_flag).await;
                    });
                    peers.insert(addr, PeerHandle { task, handshook });
                    debug!("Peer count: {}, accepted {}", peers.len(), addr);
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                }
            }
        }
    }

    /// Number of peers that completed the handshake
    pub fn active_peers(&self) -> usize {
        self.active_peers.load(Ordering::SeqCst)
    }

    /// Number of registered peers, connected or not
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Drop all peers and their connections
    pub fn stop(&self) {
        let mut peers = self.peers.lock().unwrap();
        for (_, handle) in peers.drain() {
            handle.task.abort();
        }
        self.active_peers.store(0, Ordering::SeqCst);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("peers", &self.peer_count())
            .field("active", &self.active_peers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Extension, Extensions, Handshake};
    use std::io::Write;

    fn test_manager(config: Config) -> Arc<PeerManager> {
        let torrent = b"d8:announce18:http://t.example/a4:infod6:lengthi16384e4:name4:test12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(torrent).unwrap();
        file.flush().unwrap();
        let metadata = Arc::new(Metadata::from_torrent_file(file.path()).unwrap());
        let store = PieceStore::new(metadata.clone(), std::env::temp_dir());
        PeerManager::new(config, metadata, store)
    }

    #[test]
    fn test_calculate_handshake_layout() {
        let manager = test_manager(Config::new().with_extensions(Extensions::none()));
        let mut info_hash = [0u8; 20];
        for (i, byte) in info_hash.iter_mut().enumerate() {
            *byte = (i + 1) as u8;
        }
        let peer_id = *b"-KK1000-abcdefghijkl";

        manager.calculate_handshake(&info_hash, &peer_id).unwrap();
        let bytes = manager.handshake_bytes().unwrap();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 0x13);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &info_hash);
        assert_eq!(&bytes[48..68], &peer_id);

        // The laid-out bytes parse back as a valid handshake.
        let parsed = Handshake::deserialize(&bytes).unwrap();
        assert!(parsed.validate(&info_hash));
    }

    #[test]
    fn test_calculate_handshake_rejects_bad_lengths() {
        let manager = test_manager(Config::new());
        assert!(manager.calculate_handshake(&[0u8; 19], &[0u8; 20]).is_err());
        assert!(manager.calculate_handshake(&[0u8; 20], &[0u8; 21]).is_err());
        assert!(manager.handshake_bytes().is_none());
    }

    #[test]
    fn test_calculate_handshake_extension_bit() {
        let mut extensions = Extensions::none();
        extensions.add(Extension::ExtensionProtocol);
        let manager = test_manager(Config::new().with_extensions(extensions));

        manager
            .calculate_handshake(&[1u8; 20], &[2u8; 20])
            .unwrap();
        let bytes = manager.handshake_bytes().unwrap();
        assert_eq!(bytes[25], 0x10);
    }

    #[tokio::test]
    async fn test_add_ignores_duplicates() {
        let manager = test_manager(Config::new());
        let addr: SocketAddr = "127.0.0.1:16999".parse().unwrap();

        manager.add(addr);
        manager.add(addr);
        assert_eq!(manager.peer_count(), 1);

        manager.stop();
        assert_eq!(manager.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_peer_is_noop() {
        let manager = test_manager(Config::new());
        let addr: SocketAddr = "127.0.0.1:17000".parse().unwrap();
        manager.remove(&addr);
        assert_eq!(manager.peer_count(), 0);
        assert_eq!(manager.active_peers(), 0);
    }
}
