// A session with one remote peer: handshake, inventory exchange, and the
// block-download driver.
//
// The session is a state machine over a framed message stream. Messages
// are handled in arrival order; every call into the chain engine goes
// through the engine mutex, so delivery is serialized across sessions.

use crate::consensus::chain::{AddBlockResult, ChainEngine, ChainError};
use crate::core::serialize::CodecError;
use crate::core::Hash256;
use crate::network::message::{
    FrameHeader, GetHeadersMessage, Inventory, Message, NetAddress, RejectMessage,
    VersionMessage, FRAME_HEADER_SIZE, MAX_HEADERS_PER_MSG, REJECT_INVALID,
};
use crate::storage::ChainStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;

/// A peer must complete the version/verack exchange within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often we ping an idle peer
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

/// A pong must arrive within this deadline of its ping
pub const PING_TIMEOUT: Duration = Duration::from_secs(90);

/// An in-flight block request is retried elsewhere after this long
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Blocks one session may have in flight at once
pub const MAX_INFLIGHT_PER_PEER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Why a session ended
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),
    #[error("transport: {0}")]
    Io(String),
    #[error("peer supplied an invalid block {hash}: {reason}")]
    BadBlock { hash: Hash256, reason: String },
    #[error("internal: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io(err.to_string())
    }
}

impl From<ChainError> for PeerError {
    fn from(err: ChainError) -> Self {
        PeerError::Internal(err.to_string())
    }
}

/// What the remote end told us about itself
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

/// Blocks currently being fetched, shared across sessions so no two peers
/// download the same block at once.
#[derive(Default)]
pub struct RequestTracker {
    inner: Mutex<HashMap<Hash256, InFlight>>,
}

struct InFlight {
    peer_id: u64,
    since: Instant,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a block for a session. Returns false when another session
    /// already has a live request for it.
    pub fn try_begin(&self, hash: Hash256, peer_id: u64) -> bool {
        let mut inner = self.inner.lock().expect("request tracker poisoned");
        match inner.get(&hash) {
            Some(entry) if entry.since.elapsed() < REQUEST_TIMEOUT => false,
            _ => {
                inner.insert(
                    hash,
                    InFlight {
                        peer_id,
                        since: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Whether this session owns the live request for a block
    pub fn owns(&self, hash: &Hash256, peer_id: u64) -> bool {
        let inner = self.inner.lock().expect("request tracker poisoned");
        inner.get(hash).map_or(false, |entry| entry.peer_id == peer_id)
    }

    pub fn complete(&self, hash: &Hash256) {
        let mut inner = self.inner.lock().expect("request tracker poisoned");
        inner.remove(hash);
    }

    /// Number of blocks a session currently has in flight
    pub fn count_for(&self, peer_id: u64) -> usize {
        let inner = self.inner.lock().expect("request tracker poisoned");
        inner.values().filter(|entry| entry.peer_id == peer_id).count()
    }

    /// Forget everything a departing session had in flight
    pub fn release_peer(&self, peer_id: u64) {
        let mut inner = self.inner.lock().expect("request tracker poisoned");
        inner.retain(|_, entry| entry.peer_id != peer_id);
    }

    /// Remove and return requests that outlived the timeout; the caller
    /// re-issues them through other peers.
    pub fn take_expired(&self) -> Vec<Hash256> {
        let mut inner = self.inner.lock().expect("request tracker poisoned");
        let expired: Vec<Hash256> = inner
            .iter()
            .filter(|(_, entry)| entry.since.elapsed() >= REQUEST_TIMEOUT)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            inner.remove(hash);
        }
        expired
    }
}

/// One connection to one remote peer
pub struct PeerSession<S: ChainStore> {
    pub id: u64,
    pub addr: SocketAddr,
    magic: u32,
    protocol_version: u32,
    engine: Arc<AsyncMutex<ChainEngine<S>>>,
    requests: Arc<RequestTracker>,
    state: SessionState,
    info: Option<PeerInfo>,
    our_nonce: u64,
    pending_ping: Option<(u64, Instant)>,
}

impl<S: ChainStore> PeerSession<S> {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        magic: u32,
        protocol_version: u32,
        engine: Arc<AsyncMutex<ChainEngine<S>>>,
        requests: Arc<RequestTracker>,
    ) -> Self {
        Self {
            id,
            addr,
            magic,
            protocol_version,
            engine,
            requests,
            state: SessionState::Connecting,
            info: None,
            our_nonce: 0,
            pending_ping: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn info(&self) -> Option<&PeerInfo> {
        self.info.as_ref()
    }

    /// Drive the session until the peer disconnects, an error closes it,
    /// or shutdown is signalled. `outbound_rx` carries messages other parts
    /// of the node want pushed to this peer.
    pub async fn run(
        &mut self,
        stream: TcpStream,
        mut outbound_rx: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PeerError> {
        let result = self
            .drive(stream, &mut outbound_rx, &mut shutdown)
            .await;
        self.state = SessionState::Closed;
        self.requests.release_peer(self.id);
        if let Err(err) = &result {
            log::warn!("peer {} closed: {}", self.addr, err);
        }
        result
    }

    async fn drive(
        &mut self,
        stream: TcpStream,
        outbound_rx: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PeerError> {
        let (mut reader, mut writer) = stream.into_split();

        self.state = SessionState::Handshaking;
        match timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut reader, &mut writer)).await {
            Err(_) => return Err(PeerError::HandshakeTimeout),
            Ok(result) => result?,
        }
        self.state = SessionState::Active;
        log::info!(
            "peer {} active ({})",
            self.addr,
            self.info.as_ref().map_or("?", |i| i.user_agent.as_str())
        );

        // Kick off header sync from our current tip
        let locator = { self.engine.lock().await.block_locator()? };
        self.send(
            &mut writer,
            &Message::GetHeaders(GetHeadersMessage {
                version: self.protocol_version,
                locator,
                stop: Hash256::zero(),
            }),
        )
        .await?;

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // the first tick fires immediately

        // The read future owns the reader and survives across select
        // rounds, so a timer or push firing mid-frame cannot make us lose
        // half-read bytes.
        let mut read_fut = Box::pin(read_frame_owned(reader, self.magic));
        loop {
            tokio::select! {
                result = &mut read_fut => {
                    let (message, reader) = result?;
                    read_fut = Box::pin(read_frame_owned(reader, self.magic));
                    self.handle(message, &mut writer).await?;
                }
                _ = ping_timer.tick() => {
                    if let Some((_, sent)) = self.pending_ping {
                        if sent.elapsed() > PING_TIMEOUT {
                            return Err(PeerError::Protocol("ping timed out".into()));
                        }
                    }
                    let nonce: u64 = rand::random();
                    self.pending_ping = Some((nonce, Instant::now()));
                    self.send(&mut writer, &Message::Ping(nonce)).await?;
                }
                pushed = outbound_rx.recv() => {
                    match pushed {
                        // A dropped sender means the node let go of this session
                        Some(message) => self.send(&mut writer, &message).await?,
                        None => return Ok(()),
                    }
                }
                _ = shutdown.changed() => {
                    log::info!("peer {} closing for shutdown", self.addr);
                    return Ok(());
                }
            }
        }
    }

    /// Exchange version/verack in either order
    async fn handshake(
        &mut self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        let start_height = {
            let engine = self.engine.lock().await;
            engine.chain_head()?.height
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let version = VersionMessage::new(
            self.protocol_version,
            NetAddress::from_socket_addr(self.addr, 0),
            start_height,
            now,
        );
        self.our_nonce = version.nonce;
        self.send(writer, &Message::Version(version)).await?;

        let mut got_version = false;
        let mut got_verack = false;
        while !(got_version && got_verack) {
            match read_frame(reader, self.magic).await? {
                Message::Version(theirs) => {
                    if got_version {
                        return Err(PeerError::Protocol("duplicate version".into()));
                    }
                    if theirs.nonce == self.our_nonce {
                        return Err(PeerError::Protocol("connected to self".into()));
                    }
                    self.info = Some(PeerInfo {
                        addr: self.addr,
                        version: theirs.version,
                        services: theirs.services,
                        user_agent: theirs.user_agent,
                        start_height: theirs.start_height,
                        relay: theirs.relay,
                    });
                    got_version = true;
                    self.send(writer, &Message::Verack).await?;
                }
                Message::Verack => {
                    got_verack = true;
                }
                other => {
                    return Err(PeerError::Protocol(format!(
                        "unexpected {} during handshake",
                        other.command()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        message: Message,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        match message {
            Message::Ping(nonce) => self.send(writer, &Message::Pong(nonce)).await,
            Message::Pong(nonce) => {
                if let Some((expected, _)) = self.pending_ping {
                    if expected == nonce {
                        self.pending_ping = None;
                    }
                }
                Ok(())
            }
            Message::Inv(items) => self.handle_inv(items, writer).await,
            Message::Headers(headers) => self.handle_headers(headers, writer).await,
            Message::Block(block) => self.handle_block(block, writer).await,
            Message::GetHeaders(request) => {
                let headers = {
                    let engine = self.engine.lock().await;
                    engine.headers_after(&request.locator, &request.stop, MAX_HEADERS_PER_MSG)?
                };
                self.send(writer, &Message::Headers(headers)).await
            }
            Message::GetData(items) => self.handle_getdata(items, writer).await,
            Message::Mempool => {
                // No mempool is kept; answer with an empty inventory
                self.send(writer, &Message::Inv(Vec::new())).await
            }
            Message::Tx(tx) => {
                log::debug!("peer {} relayed tx {}, ignored", self.addr, tx.txid());
                Ok(())
            }
            Message::NotFound(items) => {
                // Give the blocks back to the tracker so another peer can try
                for item in items {
                    if self.requests.owns(&item.hash, self.id) {
                        self.requests.complete(&item.hash);
                    }
                }
                Ok(())
            }
            Message::Reject(reject) => {
                log::warn!(
                    "peer {} rejected our {}: {} ({:#04x})",
                    self.addr,
                    reject.message,
                    reject.reason,
                    reject.code
                );
                Ok(())
            }
            Message::Version(_) | Message::Verack => Err(PeerError::Protocol(
                "handshake message on an active session".into(),
            )),
        }
    }

    async fn handle_inv(
        &mut self,
        items: Vec<Inventory>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        let mut wanted = Vec::new();
        {
            let engine = self.engine.lock().await;
            for item in items {
                if !matches!(item.kind, crate::network::message::InvType::Block) {
                    continue;
                }
                if engine.is_known(&item.hash)? {
                    continue;
                }
                if self.requests.count_for(self.id) + wanted.len() >= MAX_INFLIGHT_PER_PEER {
                    break;
                }
                if self.requests.try_begin(item.hash, self.id) {
                    wanted.push(Inventory::block(item.hash));
                }
            }
        }
        if !wanted.is_empty() {
            self.send(writer, &Message::GetData(wanted)).await?;
        }
        Ok(())
    }

    async fn handle_headers(
        &mut self,
        headers: Vec<crate::core::BlockHeader>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        let full_batch = headers.len() == MAX_HEADERS_PER_MSG;
        let mut wanted = Vec::new();
        {
            let engine = self.engine.lock().await;
            for header in &headers {
                let hash = header.hash();
                if engine.is_known(&hash)? {
                    continue;
                }
                if self.requests.count_for(self.id) + wanted.len() >= MAX_INFLIGHT_PER_PEER {
                    break;
                }
                if self.requests.try_begin(hash, self.id) {
                    wanted.push(Inventory::block(hash));
                }
            }
        }
        if !wanted.is_empty() {
            self.send(writer, &Message::GetData(wanted)).await?;
        }
        if full_batch {
            // The peer has more; continue walking
            let locator = { self.engine.lock().await.block_locator()? };
            self.send(
                writer,
                &Message::GetHeaders(GetHeadersMessage {
                    version: self.protocol_version,
                    locator,
                    stop: Hash256::zero(),
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_block(
        &mut self,
        block: crate::core::Block,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        let hash = block.hash();
        if !self.requests.owns(&hash, self.id) {
            return Err(PeerError::Protocol(format!(
                "unsolicited block {hash}"
            )));
        }
        self.requests.complete(&hash);

        let result = {
            let mut engine = self.engine.lock().await;
            engine.add_block(block)
        };
        match result {
            Ok(AddBlockResult::NewBest) => {
                log::debug!("peer {} advanced the chain with {}", self.addr, hash);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ChainError::Orphan { missing_parent, .. }) => {
                // Find the ancestry we are missing
                log::debug!(
                    "block {} is an orphan (parent {}), requesting headers",
                    hash,
                    missing_parent
                );
                let locator = { self.engine.lock().await.block_locator()? };
                self.send(
                    writer,
                    &Message::GetHeaders(GetHeadersMessage {
                        version: self.protocol_version,
                        locator,
                        stop: Hash256::zero(),
                    }),
                )
                .await
            }
            Err(ChainError::Verification(err)) => {
                let reject = RejectMessage {
                    message: "block".into(),
                    code: REJECT_INVALID,
                    reason: err.to_string(),
                    data: Some(hash),
                };
                let _ = self.send(writer, &Message::Reject(reject)).await;
                Err(PeerError::BadBlock {
                    hash,
                    reason: err.to_string(),
                })
            }
            Err(ChainError::ReorgTooDeep { depth, max }) => {
                log::error!(
                    "abandoning branch at {}: reorg depth {} exceeds {}",
                    hash,
                    depth,
                    max
                );
                Ok(())
            }
            Err(err @ ChainError::Store(_)) => Err(PeerError::Internal(err.to_string())),
        }
    }

    async fn handle_getdata(
        &mut self,
        items: Vec<Inventory>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        let mut not_found = Vec::new();
        for item in items {
            let body = match item.kind {
                crate::network::message::InvType::Block => {
                    let engine = self.engine.lock().await;
                    engine.block_body(&item.hash)?
                }
                // No mempool: transactions are only served inside blocks
                crate::network::message::InvType::Tx => None,
            };
            match body {
                Some(block) => self.send(writer, &Message::Block(block)).await?,
                None => not_found.push(item),
            }
        }
        if !not_found.is_empty() {
            self.send(writer, &Message::NotFound(not_found)).await?;
        }
        Ok(())
    }

    async fn send(
        &self,
        writer: &mut OwnedWriteHalf,
        message: &Message,
    ) -> Result<(), PeerError> {
        writer.write_all(&message.to_frame(self.magic)).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Ownership-passing wrapper so the session loop can keep one read in
/// flight across `select!` rounds
async fn read_frame_owned(
    mut reader: OwnedReadHalf,
    magic: u32,
) -> Result<(Message, OwnedReadHalf), PeerError> {
    let message = read_frame(&mut reader, magic).await?;
    Ok((message, reader))
}

/// Read one complete frame off the stream
async fn read_frame(reader: &mut OwnedReadHalf, magic: u32) -> Result<Message, PeerError> {
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(&header_bytes)?;
    header.validate(magic)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok(header.decode_payload(&payload)?)
}
