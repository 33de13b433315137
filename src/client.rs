//! Client orchestrator
//!
//! Owns the identity (peer id) and wires the components together:
//! metadata feeds the piece store once ready, trackers feed discovered
//! endpoints into the peer manager, and peers drive the piece store
//! until the download finishes.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::peer::PeerManager;
use crate::protocol::Handshake;
use crate::storage::PieceStore;
use crate::torrent::Metadata;
use crate::tracker::TrackerManager;

/// A running torrent client
pub struct Client {
    config: Config,
    peer_id: [u8; 20],

    metadata: Arc<Metadata>,
    store: Arc<PieceStore>,
    peer_manager: Arc<PeerManager>,
    tracker_manager: Arc<TrackerManager>,

    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build and start a client for the given torrent
    ///
    /// `torrent` is either a path to a .torrent file or a magnet URI.
    /// Parse failures are fatal; everything later recovers per peer or
    /// per tracker.
    pub async fn start(torrent: &str, config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let peer_id = Handshake::generate_peer_id();
        info!("Peer id: {}", String::from_utf8_lossy(&peer_id));

        let metadata = Arc::new(Metadata::create(torrent)?);
        let store = PieceStore::new(metadata.clone(), config.output_dir.clone());
        let peer_manager = PeerManager::new(config.clone(), metadata.clone(), store.clone());
        let tracker_manager = TrackerManager::new(metadata.clone(), peer_id, config.port);

        // The info hash is known even for magnet links, so the handshake
        // can be laid out right away.
        peer_manager.calculate_handshake(&metadata.info_hash(), &peer_id)?;

        // The working file needs the piece list; for magnet links that
        // arrives later, so the initialization hangs off the ready latch.
        if metadata.is_ready() {
            store.init_file().await?;
        } else {
            let init_store = store.clone();
            let handle = tokio::runtime::Handle::current();
            metadata.on_ready(move || {
                handle.spawn(async move {
                    if let Err(e) = init_store.init_file().await {
                        error!("Failed to initialize the working file: {:#}", e);
                        init_store.stop();
                    }
                });
            });
        }

        // Trackers hand every endpoint they find to the peer manager.
        let add_peer = peer_manager.clone();
        tracker_manager.set_on_new_peer(move |addr| {
            add_peer.add(addr);
        });
        for announce in metadata.trackers() {
            tracker_manager.add(announce);
        }

        let accept_task = tokio::spawn(peer_manager.clone().accept_peers());

        Ok(Arc::new(Self {
            config,
            peer_id,
            metadata,
            store,
            peer_manager,
            tracker_manager,
            accept_task: Mutex::new(Some(accept_task)),
        }))
    }

    /// Block until the download has finished or `stop` was called
    pub async fn wait(&self) {
        self.metadata.wait().await;
        self.store.wait().await;
    }

    /// Release all waiters and tear every connection down
    pub fn stop(&self) {
        info!("Stopping client");
        self.metadata.stop();
        self.store.stop();
        self.tracker_manager.stop();
        self.peer_manager.stop();
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
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

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn tracker_manager(&self) -> &Arc<TrackerManager> {
        &self.tracker_manager
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
