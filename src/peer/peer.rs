//! Peer connection state machine
//!
//! Each remote peer runs as one task: connect (or accept), exchange the
//! 68-byte handshake, then loop over incoming messages while pipelining
//! block requests for the piece currently reserved for this peer. A
//! starved peer retries assignment on a timer until a piece frees up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::protocol::{wire, Message};
use crate::peer::PeerManager;
use crate::storage::{Bitfield, WriteOutcome};

/// Outbound connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a starved peer waits before retrying piece assignment
const ASSIGN_RETRY: Duration = Duration::from_secs(10);

/// State of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection (initial and terminal)
    Disconnected,
    /// Socket is up, handshake in flight
    Connected,
    /// Handshake verified
    Handshook,
    /// Waiting for a piece to download
    Idle,
    /// Requesting and receiving blocks of the reserved piece
    DownloadingPiece,
}

/// A single remote peer
pub struct Peer {
    manager: Arc<PeerManager>,
    addr: SocketAddr,
    remote_peer_id: Option<[u8; 20]>,

    state: PeerState,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    /// The remote side's bitfield; synthesized all-zero when the peer
    /// never sent one
    peer_bitfield: Option<Arc<Bitfield>>,

    /// Piece currently reserved for this peer
    current_piece: Option<usize>,
    /// Next block index to request within the current piece
    current_block: usize,
    /// Requests sent in the current batch
    batch_sent: usize,
    /// Responses received for the current batch
    piece_received: usize,

    /// Shared with the manager so removal can settle the active count
    handshook: Arc<AtomicBool>,
}

impl Peer {
    fn new(manager: Arc<PeerManager>, addr: SocketAddr, handshook: Arc<AtomicBool>) -> Self {
        Self {
            manager,
            addr,
            remote_peer_id: None,
            state: PeerState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: None,
            current_piece: None,
            current_block: 0,
            batch_sent: 0,
            piece_received: 0,
            handshook,
        }
    }

    /// Drive an outbound connection for its whole lifetime
    ///
    /// The task unregisters itself from the manager when it ends, however
    /// it ends.
    pub async fn run_outbound(
        manager: Arc<PeerManager>,
        addr: SocketAddr,
        handshook: Arc<AtomicBool>,
    ) {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let peer = Peer::new(manager.clone(), addr, handshook);
                if let Err(e) = peer.run(stream).await {
                    debug!("Peer {} closed: {:#}", addr, e);
                }
            }
            Ok(Err(e)) => debug!("Failed to connect to {}: {}", addr, e),
            Err(_) => debug!("Connection to {} timed out", addr),
        }
        manager.remove(&addr);
    }

    /// Drive an accepted inbound connection for its whole lifetime
    pub async fn run_inbound(
        manager: Arc<PeerManager>,
        stream: TcpStream,
        addr: SocketAddr,
        handshook: Arc<AtomicBool>,
    ) {
        let peer = Peer::new(manager.clone(), addr, handshook);
        if let Err(e) = peer.run(stream).await {
            debug!("Peer {} closed: {:#}", addr, e);
        }
        manager.remove(&addr);
    }

    async fn run(mut self, stream: TcpStream) -> Result<()> {
        self.state = PeerState::Connected;
        let result = self.drive(stream).await;
        // Whatever ended the connection, re-expose a reserved piece.
        self.release_current_piece();
        self.state = PeerState::Disconnected;
        result
    }

    async fn drive(&mut self, mut stream: TcpStream) -> Result<()> {
        // Both sides send their handshake eagerly.
        let handshake = self.manager.handshake_bytes().ok_or_else(|| {
            TorrentError::peer_error_with_peer("Handshake bytes not ready", self.addr.to_string())
        })?;
        tokio::io::AsyncWriteExt::write_all(&mut stream, &handshake).await?;
        trace!("Sent handshake to {}", self.addr);

        let remote = wire::read_handshake(&mut stream).await?;
        if !remote.validate(&self.manager.metadata().info_hash()) {
            return Err(TorrentError::peer_error_with_peer(
                "Handshake rejected",
                self.addr.to_string(),
            )
            .into());
        }
        self.remote_peer_id = Some(remote.peer_id);
        self.state = PeerState::Handshook;
        self.handshook.store(true, Ordering::SeqCst);
        self.manager.on_handshake(self.addr, remote.peer_id);

        let (mut rd, mut wr) = stream.into_split();

        // Our bitfield goes out first (when the store is up), then an
        // unchoke so the remote may request from us.
        if let Some(bitfield) = self.manager.store().bitfield() {
            wire::write_message(&mut wr, &bitfield.as_message()).await?;
        }
        wire::write_message(&mut wr, &Message::Unchoke).await?;
        self.am_choking = false;

        self.message_loop(&mut rd, &mut wr).await
    }

    async fn message_loop(
        &mut self,
        rd: &mut OwnedReadHalf,
        wr: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let max_message_length = self.manager.config().max_message_length;
        let mut frames = wire::FrameReader::new();

        loop {
            tokio::select! {
                result = frames.next(rd, max_message_length) => {
                    let message = result?;
                    self.on_message(message, wr).await?;
                }
                _ = tokio::time::sleep(ASSIGN_RETRY), if self.wants_piece() => {
                    trace!("Retrying piece assignment for {}", self.addr);
                    self.assign_and_request(wr).await?;
                }
            }
        }
    }

    /// Whether this peer should (re)try to reserve a piece
    fn wants_piece(&self) -> bool {
        matches!(self.state, PeerState::Idle | PeerState::DownloadingPiece)
            && self.current_piece.is_none()
            && !self.peer_choking
    }

    async fn on_message(&mut self, message: Message, wr: &mut OwnedWriteHalf) -> Result<()> {
        trace!("{} sent {:?}", self.addr, message.message_id());
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                // The reservation is released so other peers can finish
                // the piece while we are choked.
                self.release_current_piece();
            }
            Message::Unchoke => {
                self.peer_choking = false;
                if self.state == PeerState::Handshook {
                    self.state = PeerState::Idle;
                    self.assign_and_request(wr).await?;
                }
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => self.on_have(piece_index as usize),
            Message::Bitfield { bitfield } => self.on_bitfield(bitfield),
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(index, begin, length, wr).await?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_piece(index, begin, block, wr).await?,
            Message::Cancel { .. } => {
                // Nothing is queued per-peer, so there is nothing to cancel.
            }
            Message::Extended { ext_id, .. } => {
                debug!("Dropping extended message {} from {}", ext_id, self.addr);
            }
            Message::Invalid { id } => {
                debug!("Dropping unknown message id {} from {}", id, self.addr);
            }
        }
        Ok(())
    }

    fn on_have(&mut self, piece_index: usize) {
        match self.ensure_peer_bitfield() {
            Some(bitfield) => bitfield.set_piece(piece_index),
            None => debug!("Ignoring Have from {} before metadata is ready", self.addr),
        }
    }

    fn on_bitfield(&mut self, mut payload: Vec<u8>) {
        if !self.manager.metadata().is_ready() {
            warn!("Ignoring bitfield from {} before metadata is ready", self.addr);
            return;
        }
        let Some(local) = self.manager.store().bitfield() else {
            warn!("Ignoring bitfield from {} before the store is up", self.addr);
            return;
        };
        if payload.len() < local.len() {
            warn!(
                "Ignoring short bitfield from {} ({} < {} bytes)",
                self.addr,
                payload.len(),
                local.len()
            );
            return;
        }
        // Assignment scans the two fields in lockstep, so the remote copy
        // is held at exactly our byte length.
        payload.truncate(local.len());
        self.peer_bitfield = Some(Arc::new(Bitfield::from_bytes(payload)));
    }

    async fn on_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
        wr: &mut OwnedWriteHalf,
    ) -> Result<()> {
        if length as usize > self.manager.config().max_message_length {
            return Err(TorrentError::peer_error_full(
                "Request exceeds maximum message length",
                self.addr.to_string(),
                format!("length {}", length),
            )
            .into());
        }

        let Some(local) = self.manager.store().bitfield() else {
            debug!("Ignoring request from {} before the store is up", self.addr);
            return Ok(());
        };
        if !local.has_piece(index as usize) {
            debug!(
                "Ignoring request from {} for piece {} we do not have",
                self.addr, index
            );
            return Ok(());
        }

        let piece = self
            .manager
            .store()
            .read_block(index as usize, begin as usize, length as usize)
            .await?;
        wire::write_message(wr, &piece).await?;
        self.manager.metadata().increase_uploaded(length as u64);
        Ok(())
    }

    async fn on_piece(
        &mut self,
        index: u32,
        begin: u32,
        block: Vec<u8>,
        wr: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let Some(current) = self.current_piece else {
            debug!("Ignoring unexpected block from {}", self.addr);
            return Ok(());
        };

        self.manager
            .metadata()
            .increase_downloaded(block.len() as u64);

        match self
            .manager
            .store()
            .write_block(index as usize, begin as usize, block)
            .await
        {
            Ok(WriteOutcome::InProgress) => {
                self.piece_received += 1;
                if self.piece_received == self.batch_sent {
                    // The batch has drained; request the next one.
                    self.send_requests(wr).await?;
                }
            }
            Ok(WriteOutcome::PieceComplete) => {
                if let Some(local) = self.manager.store().bitfield() {
                    local.piece_success(Some(current));
                }
                info!(
                    "Piece {} complete ({}/{} done)",
                    current,
                    self.manager.metadata().pieces_done(),
                    self.manager.metadata().piece_count()
                );
                self.current_piece = None;
                self.current_block = 0;
                self.state = PeerState::Idle;
                self.assign_and_request(wr).await?;
            }
            Ok(WriteOutcome::HashMismatch) => {
                // The piece goes back into the pool; the peer is kept.
                warn!("Piece {} from {} failed verification", current, self.addr);
                if let Some(local) = self.manager.store().bitfield() {
                    local.piece_failed(Some(current));
                }
                self.current_piece = None;
                self.current_block = 0;
                self.state = PeerState::Idle;
                self.assign_and_request(wr).await?;
            }
            Ok(WriteOutcome::Ignored) => {
                debug!("Store ignored block from {}", self.addr);
            }
            Err(e) => {
                // Rewind to the start of the failed batch and re-request.
                error!("Failed to write block from {}: {:#}", self.addr, e);
                self.current_block = self.current_block.saturating_sub(self.batch_sent);
                self.send_requests(wr).await?;
            }
        }
        Ok(())
    }

    /// Reserve the next piece this peer can provide and start requesting
    async fn assign_and_request(&mut self, wr: &mut OwnedWriteHalf) -> Result<()> {
        let Some(local) = self.manager.store().bitfield() else {
            return Ok(());
        };
        let peer_bits = match self.ensure_peer_bitfield() {
            Some(bits) => bits,
            None => return Ok(()),
        };

        match local.assign_piece(&peer_bits) {
            Some(piece_index) => {
                info!("Assigned piece {} to {}", piece_index, self.addr);
                self.current_piece = Some(piece_index);
                self.current_block = 0;
                self.state = PeerState::DownloadingPiece;
                self.send_requests(wr).await?;
            }
            None => {
                debug!("No assignable piece for {}", self.addr);
                self.state = PeerState::Idle;
            }
        }
        Ok(())
    }

    /// Send the next batch of block requests for the current piece
    async fn send_requests(&mut self, wr: &mut OwnedWriteHalf) -> Result<()> {
        let Some(piece_index) = self.current_piece else {
            return Ok(());
        };

        let metadata = self.manager.metadata();
        let actual_length = actual_piece_length(
            piece_index,
            metadata.piece_count(),
            metadata.piece_length(),
            metadata.total_length(),
        );
        let plan = plan_requests(
            actual_length,
            self.manager.config().block_length,
            self.current_block,
            self.manager.config().request_per_call,
        );

        self.batch_sent = 0;
        self.piece_received = 0;
        for (begin, length) in plan {
            wire::write_message(
                wr,
                &Message::Request {
                    index: piece_index as u32,
                    begin: begin as u32,
                    length: length as u32,
                },
            )
            .await?;
            self.current_block += 1;
            self.batch_sent += 1;
        }
        trace!(
            "Requested {} blocks of piece {} from {}",
            self.batch_sent,
            piece_index,
            self.addr
        );
        Ok(())
    }

    /// Give a reserved piece back to the pool
    fn release_current_piece(&mut self) {
        if let Some(piece_index) = self.current_piece.take() {
            if let Some(local) = self.manager.store().bitfield() {
                local.piece_failed(Some(piece_index));
            }
            self.current_block = 0;
            self.batch_sent = 0;
            self.piece_received = 0;
        }
    }

    /// The remote bitfield, synthesized as all-zero when none was sent
    fn ensure_peer_bitfield(&mut self) -> Option<Arc<Bitfield>> {
        if let Some(bits) = &self.peer_bitfield {
            return Some(bits.clone());
        }
        let local = self.manager.store().bitfield()?;
        let bits = Arc::new(Bitfield::new(local.len()));
        self.peer_bitfield = Some(bits.clone());
        Some(bits)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.remote_peer_id {
            Some(id) => write!(f, "Peer{{ {} }}", String::from_utf8_lossy(id)),
            None => write!(f, "Peer{{ {} }}", self.addr),
        }
    }
}

/// Length of the given piece, accounting for a short final piece
fn actual_piece_length(
    piece_index: usize,
    piece_count: usize,
    piece_length: usize,
    total_length: u64,
) -> usize {
    if piece_count > 0 && piece_index == piece_count - 1 {
        (total_length - piece_index as u64 * piece_length as u64) as usize
    } else {
        piece_length
    }
}

/// Plan one batch of block requests
///
/// Produces up to `request_per_call` consecutive `(begin, length)` pairs
/// starting at `current_block`, clamping the final block to the end of
/// the piece.
fn plan_requests(
    actual_piece_length: usize,
    block_length: usize,
    current_block: usize,
    request_per_call: usize,
) -> Vec<(usize, usize)> {
    let block_count = actual_piece_length.div_ceil(block_length);
    let mut plan = Vec::new();
    let mut block = current_block;
    while plan.len() < request_per_call && block < block_count {
        let begin = block * block_length;
        let length = std::cmp::min(block_length, actual_piece_length - begin);
        plan.push((begin, length));
        block += 1;
    }
    plan
}
