//! Trackers
//!
//! Periodic peer discovery. Each announce URL runs as one task, picked by
//! scheme: `udp://` speaks BEP15, `http://` and `https://` announce over
//! HTTP GET. The manager owns the registry and hands discovered peer
//! endpoints to whoever registered the new-peer hook.

pub mod http;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One successful announce: the re-announce interval and the peer list
#[derive(Debug)]
pub struct AnnounceResponse {
    /// Seconds until the tracker wants the next announce
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

type NewPeerHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Registry of tracker tasks keyed by announce URL
pub struct TrackerManager {
    metadata: Arc<crate::torrent::Metadata>,
    peer_id: [u8; 20],
    port: u16,

    trackers: Mutex<HashMap<String, JoinHandle<()>>>,
    on_new_peer: Mutex<Option<NewPeerHook>>,
}

impl TrackerManager {
    pub fn new(metadata: Arc<crate::torrent::Metadata>, peer_id: [u8; 20], port: u16) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            peer_id,
            port,
            trackers: Mutex::new(HashMap::new()),
            on_new_peer: Mutex::new(None),
        })
    }

    /// Install the handler called for every peer endpoint a tracker finds
    pub fn set_on_new_peer<F>(&self, hook: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        *self.on_new_peer.lock().unwrap() = Some(Arc::new(hook));
    }

    pub(crate) fn notify_new_peer(&self, addr: SocketAddr) {
        let hook = self.on_new_peer.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(addr);
        }
    }

    /// Start a tracker task for the announce URL if none is running yet
    pub fn add(self: &Arc<Self>, announce: String) {
        let mut trackers = self.trackers.lock().unwrap();
        if trackers.contains_key(&announce) {
            return;
        }

        info!("New tracker: {}", announce);
        let manager = self.clone();
        let url = announce.clone();
        let task = tokio::spawn(async move {
            run_tracker(manager, url).await;
        });
        trackers.insert(announce, task);
    }

    /// Deregister and stop the tracker for the announce URL
    pub fn remove(&self, announce: &str) {
        let mut trackers = self.trackers.lock().unwrap();
        if let Some(task) = trackers.remove(announce) {
            task.abort();
            info!(
                "Tracker count: {}, connection lost with {}",
                trackers.len(),
                announce
            );
        }
    }

    /// Stop every tracker task
    pub fn stop(&self) {
        let mut trackers = self.trackers.lock().unwrap();
        for (_, task) in trackers.drain() {
            task.abort();
        }
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.lock().unwrap().len()
    }

    pub fn metadata(&self) -> &Arc<crate::torrent::Metadata> {
        &self.metadata
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Debug for TrackerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerManager")
            .field("trackers", &self.tracker_count())
            .field("port", &self.port)
            .finish()
    }
}

/// Drive one tracker until it fails, then deregister it
async fn run_tracker(manager: Arc<TrackerManager>, announce: String) {
    let result = if announce.starts_with("udp://") {
        udp::announce_loop(&manager, &announce).await
    } else if announce.starts_with("http://") || announce.starts_with("https://") {
        http::announce_loop(&manager, &announce).await
    } else {
        Err(crate::error::TorrentError::tracker_error_with_announce(
            "Unsupported announce scheme",
            announce.clone(),
        )
        .into())
    };

    if let Err(e) = result {
        warn!("Tracker {} disconnected: {:#}", announce, e);
    }
    manager.remove(&announce);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Metadata;

    fn test_metadata() -> Arc<Metadata> {
        Arc::new(
            Metadata::from_magnet("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c")
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let manager = TrackerManager::new(test_metadata(), [1u8; 20], 6881);
        manager.add("udp://tracker.example.invalid:6969".to_string());
        manager.add("udp://tracker.example.invalid:6969".to_string());
        assert!(manager.tracker_count() <= 1);
        manager.stop();
    }

    #[tokio::test]
    async fn test_unsupported_scheme_deregisters() {
        let manager = TrackerManager::new(test_metadata(), [1u8; 20], 6881);
        manager.add("wss://tracker.example.com".to_string());
        // The task fails on the scheme check and removes itself.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(manager.tracker_count(), 0);
    }

    #[tokio::test]
    async fn test_new_peer_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let manager = TrackerManager::new(test_metadata(), [1u8; 20], 6881);
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        manager.set_on_new_peer(move |_addr| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        manager.notify_new_peer("1.2.3.4:6881".parse().unwrap());
        manager.notify_new_peer("5.6.7.8:6881".parse().unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
