//! HTTP/HTTPS tracker client
//!
//! Announces with a GET request carrying the standard query parameters
//! (`compact=1` always) and decodes the bencoded response: a mandatory
//! `interval` plus the compact peer string of 6-byte records. TLS and
//! SNI are the HTTP client's problem.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use super::{AnnounceResponse, TrackerManager};
use crate::bencode;
use crate::error::TorrentError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Announce forever, re-announcing at the interval the tracker dictates
///
/// Any failure bubbles out; the caller deregisters the tracker.
pub async fn announce_loop(manager: &Arc<TrackerManager>, announce: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| {
            TorrentError::tracker_error_full(
                "Failed to build HTTP client",
                announce.to_string(),
                e.to_string(),
            )
        })?;

    loop {
        let response = announce_once(&client, manager, announce).await?;
        info!(
            "Fetched {} peers from {}, next announce in {}s",
            response.peers.len(),
            announce,
            response.interval
        );
        for addr in &response.peers {
            manager.notify_new_peer(*addr);
        }
        tokio::time::sleep(Duration::from_secs(response.interval)).await;
    }
}

async fn announce_once(
    client: &reqwest::Client,
    manager: &Arc<TrackerManager>,
    announce: &str,
) -> Result<AnnounceResponse> {
    let metadata = manager.metadata();
    let url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&compact=1&left={}",
        announce,
        if announce.contains('?') { "&" } else { "?" },
        percent_encode_bytes(&metadata.info_hash()),
        percent_encode_bytes(&manager.peer_id()),
        manager.port(),
        metadata.uploaded(),
        metadata.downloaded(),
        metadata.left(),
    );
    debug!("Announcing: {}", url);

    let body = client
        .get(&url)
        .send()
        .await
        .map_err(|e| {
            TorrentError::tracker_error_full(
                "Announce request failed",
                announce.to_string(),
                e.to_string(),
            )
        })?
        .bytes()
        .await
        .map_err(|e| {
            TorrentError::tracker_error_full(
                "Failed to read announce response",
                announce.to_string(),
                e.to_string(),
            )
        })?;

    parse_announce_response(&body)
}

/// Decode a bencoded announce response
///
/// `interval` (integer) and `peers` (compact byte string) are required;
/// anything else is a malformed response.
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = bencode::parse(body)?;
    debug!("Tracker response: {}", value.to_json());

    if let Some(reason) = value.get(b"failure reason") {
        return Err(TorrentError::tracker_error(format!(
            "Tracker refused the announce: {}",
            reason.as_str_lossy().unwrap_or_default()
        ))
        .into());
    }

    let interval = value
        .get(b"interval")
        .and_then(|v| v.as_int())
        .ok_or_else(|| {
            TorrentError::parse_error("Announce response has no integer interval")
        })?;
    if interval < 0 {
        return Err(TorrentError::parse_error("Announce interval is negative").into());
    }

    let peers = value
        .get(b"peers")
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| {
            TorrentError::parse_error("Announce response has no compact peers string")
        })?;

    Ok(AnnounceResponse {
        interval: interval as u64,
        peers: parse_compact_peers(peers),
    })
}

/// Decode 6-byte compact peer records (IPv4 + big-endian port)
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

/// Percent-encode raw bytes for a query string, one `%XX` per byte
fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        output.push('%');
        output.push_str(&format!("{:02X}", byte));
    }
    output
}
