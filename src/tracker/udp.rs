//! UDP tracker client (BEP15)
//!
//! Two-step announce: obtain a connection id (valid for one minute), then
//! announce with it. Every response is validated against the request's
//! action and transaction id; an Error action carries a UTF-8 message and
//! sends the exchange back to the connect step.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info};
use url::Url;

use super::{AnnounceResponse, TrackerManager};
use crate::error::TorrentError;

/// Magic constant opening every connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A connection id may be used for one minute after it was received
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// How long to wait for a response to one packet
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause before retrying after the tracker sent an Error action
const ERROR_RETRY: Duration = Duration::from_secs(15);

/// Announce forever over UDP
///
/// Any failure bubbles out; the caller deregisters the tracker.
pub async fn announce_loop(manager: &Arc<TrackerManager>, announce: &str) -> Result<()> {
    let url = Url::parse(announce)?;
    let host = url
        .host_str()
        .ok_or_else(|| TorrentError::tracker_error_with_announce("No host in announce URL", announce))?
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| TorrentError::tracker_error_with_announce("No port in announce URL", announce))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host.as_str(), port)).await.map_err(|e| {
        TorrentError::network_error_full(
            "Failed to resolve or connect UDP tracker",
            format!("{}:{}", host, port),
            e.to_string(),
        )
    })?;

    let mut connection: Option<(u64, Instant)> = None;
    loop {
        let connection_id = match connection {
            Some((id, acquired)) if acquired.elapsed() < CONNECTION_ID_TTL => id,
            _ => match connect_exchange(&socket).await? {
                Some(id) => {
                    debug!("Tracker {} issued connection id {:#x}", announce, id);
                    connection = Some((id, Instant::now()));
                    id
                }
                None => {
                    connection = None;
                    tokio::time::sleep(ERROR_RETRY).await;
                    continue;
                }
            },
        };

        match announce_exchange(&socket, connection_id, manager).await? {
            Some(response) => {
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
            None => {
                // Tracker error action: start over from the connect step.
                connection = None;
                tokio::time::sleep(ERROR_RETRY).await;
            }
        }
    }
}

/// Step one: ask the tracker for a connection id
async fn connect_exchange(socket: &UdpSocket) -> Result<Option<u64>> {
    let transaction_id: u32 = rand::random();
    let request = build_connect_request(transaction_id);

    let Some(response) = exchange(socket, &request, ACTION_CONNECT, transaction_id).await? else {
        return Ok(None);
    };
    Ok(Some(parse_connect_response(&response)?))
}

/// Step two: announce with the connection id
async fn announce_exchange(
    socket: &UdpSocket,
    connection_id: u64,
    manager: &Arc<TrackerManager>,
) -> Result<Option<AnnounceResponse>> {
    let transaction_id: u32 = rand::random();
    let metadata = manager.metadata();
    let request = build_announce_request(&AnnounceRequest {
        connection_id,
        transaction_id,
        info_hash: metadata.info_hash(),
        peer_id: manager.peer_id(),
        downloaded: metadata.downloaded(),
        left: metadata.left(),
        uploaded: metadata.uploaded(),
        port: manager.port(),
    });

    let Some(response) = exchange(socket, &request, ACTION_ANNOUNCE, transaction_id).await? else {
        return Ok(None);
    };
    Ok(Some(parse_announce_response(&response)?))
}

/// Send one packet and receive its validated response
///
/// Returns None when the tracker answered with an Error action (logged);
/// anything else that does not match the request is an error.
async fn exchange(
    socket: &UdpSocket,
    request: &[u8],
    expected_action: u32,
    expected_transaction_id: u32,
) -> Result<Option<Vec<u8>>> {
    socket.send(request).await?;

    let mut buf = vec![0u8; 1024];
    let received = timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| TorrentError::network_error("UDP tracker response timed out"))??;
    buf.truncate(received);

    if received < 8 {
        return Err(TorrentError::parse_error(format!(
            "UDP tracker response too short ({} bytes)",
            received
        ))
        .into());
    }

    let action = read_u32(&buf, 0);
    let transaction_id = read_u32(&buf, 4);

    if transaction_id != expected_transaction_id {
        return Err(TorrentError::parse_error(format!(
            "Transaction id mismatch (expected {:#x}, got {:#x})",
            expected_transaction_id, transaction_id
        ))
        .into());
    }

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&buf[8..]);
        error!("UDP tracker error: {}", message);
        return Ok(None);
    }

    if action != expected_action {
        return Err(TorrentError::parse_error(format!(
            "Action mismatch (expected {}, got {})",
            expected_action, action
        ))
        .into());
    }

    Ok(Some(buf))
}

/// Lay out a 16-byte connect request
pub fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

/// Read the connection id out of a validated connect response
pub fn parse_connect_response(response: &[u8]) -> Result<u64> {
    if response.len() < 16 {
        return Err(TorrentError::parse_error(format!(
            "Connect response too short ({} bytes)",
            response.len()
        ))
        .into());
    }
    Ok(read_u64(response, 8))
}

/// Fields of a BEP15 announce request
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub port: u16,
}

/// Lay out a 98-byte announce request
pub fn build_announce_request(request: &AnnounceRequest) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(request.connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(request.transaction_id);
    buf.put_slice(&request.info_hash);
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(0); // event: none
    buf.put_u32(0); // ip address: default
    buf.put_u32(0); // key
    buf.put_i32(-1); // num_want: default
    buf.put_u16(request.port);
    buf.to_vec()
}

/// Decode a validated announce response
pub fn parse_announce_response(response: &[u8]) -> Result<AnnounceResponse> {
    if response.len() < 20 {
        return Err(TorrentError::parse_error(format!(
            "Announce response too short ({} bytes)",
            response.len()
        ))
        .into());
    }

    let interval = read_u32(response, 8) as u64;
    let leechers = read_u32(response, 12);
    let seeders = read_u32(response, 16);
    debug!("Announce response: {} leechers, {} seeders", leechers, seeders);

    let peers = response[20..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect();

    Ok(AnnounceResponse { interval, peers })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_layout() {
        let request = build_connect_request(0x11223344);
        assert_eq!(request.len(), 16);
        assert_eq!(read_u64(&request, 0), 0x41727101980);
        assert_eq!(read_u32(&request, 8), 0); // connect action
        assert_eq!(read_u32(&request, 12), 0x11223344);
    }

    #[test]
    fn test_connect_response_round_trip() {
        // action=0, transaction=0x11223344, connection_id=0xAABBCCDDEEFF0011
        let mut response = Vec::new();
        response.extend_from_slice(&0u32.to_be_bytes());
        response.extend_from_slice(&0x11223344u32.to_be_bytes());
        response.extend_from_slice(&0xAABBCCDDEEFF0011u64.to_be_bytes());

        assert_eq!(parse_connect_response(&response).unwrap(), 0xAABBCCDDEEFF0011);
    }

    #[test]
    fn test_connect_response_too_short() {
        assert!(parse_connect_response(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_announce_request_layout() {
        let request = build_announce_request(&AnnounceRequest {
            connection_id: 0xAABBCCDDEEFF0011,
            transaction_id: 0x55667788,
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            downloaded: 1000,
            left: 2000,
            uploaded: 3000,
            port: 6881,
        });

        assert_eq!(request.len(), 98);
        assert_eq!(read_u64(&request, 0), 0xAABBCCDDEEFF0011);
        assert_eq!(read_u32(&request, 8), 1); // announce action
        assert_eq!(read_u32(&request, 12), 0x55667788);
        assert_eq!(&request[16..36], &[1u8; 20]);
        assert_eq!(&request[36..56], &[2u8; 20]);
        assert_eq!(read_u64(&request, 56), 1000);
        assert_eq!(read_u64(&request, 64), 2000);
        assert_eq!(read_u64(&request, 72), 3000);
        assert_eq!(read_u32(&request, 80), 0); // event
        assert_eq!(read_u32(&request, 84), 0); // ip
        assert_eq!(read_u32(&request, 88), 0); // key
        assert_eq!(read_u32(&request, 92), u32::MAX); // num_want = -1
        assert_eq!(u16::from_be_bytes([request[96], request[97]]), 6881);
    }

    #[test]
    fn test_announce_response_peers() {
        let mut response = Vec::new();
        response.extend_from_slice(&1u32.to_be_bytes()); // action
        response.extend_from_slice(&7u32.to_be_bytes()); // transaction
        response.extend_from_slice(&1800u32.to_be_bytes()); // interval
        response.extend_from_slice(&3u32.to_be_bytes()); // leechers
        response.extend_from_slice(&9u32.to_be_bytes()); // seeders
        response.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1]);
        response.extend_from_slice(&[5, 6, 7, 8, 0x1A, 0xE2]);

        let announce = parse_announce_response(&response).unwrap();
        assert_eq!(announce.interval, 1800);
        assert_eq!(
            announce.peers,
            vec![
                "1.2.3.4:6881".parse::<SocketAddr>().unwrap(),
                "5.6.7.8:6882".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_exchange_against_local_responder() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(tracker_addr).await.unwrap();

        // Fake tracker: answer one connect request.
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, from) = tracker.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 16);
            assert_eq!(read_u64(&buf, 0), PROTOCOL_ID);
            let transaction_id = read_u32(&buf, 12);

            let mut response = Vec::new();
            response.extend_from_slice(&0u32.to_be_bytes());
            response.extend_from_slice(&transaction_id.to_be_bytes());
            response.extend_from_slice(&0xDEADBEEFu64.to_be_bytes());
            tracker.send_to(&response, from).await.unwrap();
        });

        let connection_id = connect_exchange(&client).await.unwrap().unwrap();
        assert_eq!(connection_id, 0xDEADBEEF);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_rejects_wrong_transaction_id() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(tracker_addr).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = tracker.recv_from(&mut buf).await.unwrap();
            let mut response = Vec::new();
            response.extend_from_slice(&0u32.to_be_bytes());
            response.extend_from_slice(&0x0BADF00Du32.to_be_bytes()); // wrong id
            response.extend_from_slice(&1u64.to_be_bytes());
            tracker.send_to(&response, from).await.unwrap();
        });

        assert!(connect_exchange(&client).await.is_err());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_error_action_is_swallowed() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(tracker_addr).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, from) = tracker.recv_from(&mut buf).await.unwrap();
            assert!(n >= 16);
            let transaction_id = read_u32(&buf, 12);
            let mut response = Vec::new();
            response.extend_from_slice(&ACTION_ERROR.to_be_bytes());
            response.extend_from_slice(&transaction_id.to_be_bytes());
            response.extend_from_slice(b"torrent not registered");
            tracker.send_to(&response, from).await.unwrap();
        });

        // Error actions are reported as None, not as a hard failure.
        assert!(connect_exchange(&client).await.unwrap().is_none());
        responder.await.unwrap();
    }
}
