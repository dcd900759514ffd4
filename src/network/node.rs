// The node: owns the chain engine, accepts and dials peers, and keeps the
// block-download machinery moving.
//
// All engine access is serialized through one async mutex; peer sessions
// run as independent tasks and contend on it per message. Shutdown is a
// watch signal every task observes, and completes only after the engine
// lock drains.

use crate::consensus::chain::ChainEngine;
use crate::consensus::params::NetworkParams;
use crate::core::Hash256;
use crate::events::ChainListener;
use crate::network::message::{Inventory, Message};
use crate::network::peer::{PeerSession, RequestTracker};
use crate::storage::{ChainStore, StoredBlock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

/// Outbound messages buffered per session before the pusher blocks
const PEER_QUEUE_DEPTH: usize = 64;

/// How often stalled block requests are swept and retried
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

struct PeerHandle {
    addr: SocketAddr,
    sender: mpsc::Sender<Message>,
}

/// A running full node: chain engine plus peer sessions
pub struct Node<S: ChainStore + 'static> {
    params: NetworkParams,
    engine: Arc<AsyncMutex<ChainEngine<S>>>,
    requests: Arc<RequestTracker>,
    peers: Arc<Mutex<HashMap<u64, PeerHandle>>>,
    next_peer_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    announce_rx: Mutex<Option<mpsc::UnboundedReceiver<Hash256>>>,
}

/// Engine listener that hands new-best hashes to the node for relaying
struct BestBlockAnnouncer {
    sender: mpsc::UnboundedSender<Hash256>,
}

impl ChainListener for BestBlockAnnouncer {
    fn new_best_block(&self, block: &StoredBlock) {
        let _ = self.sender.send(block.hash());
    }
}

impl<S: ChainStore + 'static> Node<S> {
    pub fn new(engine: ChainEngine<S>) -> Self {
        let params = engine.params().clone();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        engine.register_listener(Arc::new(BestBlockAnnouncer {
            sender: announce_tx,
        }));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            params,
            engine: Arc::new(AsyncMutex::new(engine)),
            requests: Arc::new(RequestTracker::new()),
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_peer_id: AtomicU64::new(1),
            shutdown_tx,
            announce_rx: Mutex::new(Some(announce_rx)),
        }
    }

    pub fn engine(&self) -> Arc<AsyncMutex<ChainEngine<S>>> {
        self.engine.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer map poisoned").len()
    }

    /// Accept inbound connections until shutdown
    pub async fn listen(&self, bind: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind).await?;
        log::info!("listening on {}", bind);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::info!("inbound connection from {}", addr);
                    self.spawn_session(stream, addr);
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Dial one remote peer
    pub async fn connect(&self, addr: SocketAddr) -> std::io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        log::info!("connected to {}", addr);
        self.spawn_session(stream, addr);
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound_rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.peers
            .lock()
            .expect("peer map poisoned")
            .insert(id, PeerHandle { addr, sender });

        let mut session = PeerSession::new(
            id,
            addr,
            self.params.magic,
            self.params.protocol_version,
            self.engine.clone(),
            self.requests.clone(),
        );
        let peers = self.peers.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = session.run(stream, outbound_rx, shutdown).await;
            peers.lock().expect("peer map poisoned").remove(&id);
        });
    }

    /// Background upkeep: retry stalled block requests through other peers
    /// and relay new-best announcements. Runs until shutdown.
    pub async fn run_maintenance(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut announce_rx = self
            .announce_rx
            .lock()
            .expect("announce slot poisoned")
            .take()
            .expect("run_maintenance started twice");
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let expired = self.requests.take_expired();
                    if !expired.is_empty() {
                        log::debug!("{} block requests timed out, retrying", expired.len());
                        let items: Vec<Inventory> =
                            expired.into_iter().map(Inventory::block).collect();
                        self.push_to_any_peer(Message::GetData(items)).await;
                    }
                }
                announced = announce_rx.recv() => {
                    match announced {
                        Some(hash) => {
                            self.broadcast(Message::Inv(vec![Inventory::block(hash)])).await;
                        }
                        None => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Hand a message to one connected peer (request retry path)
    async fn push_to_any_peer(&self, message: Message) {
        let target = {
            let peers = self.peers.lock().expect("peer map poisoned");
            peers.values().next().map(|handle| handle.sender.clone())
        };
        if let Some(sender) = target {
            let _ = sender.send(message).await;
        }
    }

    /// Queue a message for every connected peer
    pub async fn broadcast(&self, message: Message) {
        let senders: Vec<(SocketAddr, mpsc::Sender<Message>)> = {
            let peers = self.peers.lock().expect("peer map poisoned");
            peers
                .values()
                .map(|handle| (handle.addr, handle.sender.clone()))
                .collect()
        };
        log::debug!("broadcasting {} to {} peers", message.command(), senders.len());
        for (addr, sender) in senders {
            if sender.send(message.clone()).await.is_err() {
                log::debug!("peer {} queue closed", addr);
            }
        }
    }

    /// Signal every task to stop, then wait for the engine lock to drain so
    /// no `add_block` is cut off mid-flight.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let _engine = self.engine.lock().await;
        log::info!("node shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledChainStore;

    fn test_node() -> Node<SledChainStore> {
        let params = NetworkParams::regtest();
        let store = SledChainStore::temporary(params.max_reorg_depth).unwrap();
        let engine = ChainEngine::new(params, store).unwrap();
        Node::new(engine)
    }

    #[tokio::test]
    async fn test_node_starts_at_genesis() {
        let node = test_node();
        let engine = node.engine();
        let head = engine.lock().await.chain_head().unwrap();
        assert_eq!(head.height, 0);
        assert_eq!(node.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_engine() {
        let node = test_node();
        node.shutdown().await;
        // The engine stays usable after shutdown completes
        let engine = node.engine();
        assert!(engine.lock().await.chain_head().is_ok());
    }

    #[tokio::test]
    async fn test_sessions_handshake_over_loopback() {
        let node_a = Arc::new(test_node());
        let node_b = Arc::new(test_node());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = listener.local_addr().unwrap();
        drop(listener);

        let accept_side = node_a.clone();
        let accept = tokio::spawn(async move { accept_side.listen(bind).await });

        // Give the listener a moment to come up, then dial
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        node_b.connect(bind).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert_eq!(node_a.peer_count(), 1);
        assert_eq!(node_b.peer_count(), 1);

        node_a.shutdown().await;
        node_b.shutdown().await;
        accept.abort();
    }
}
