// Chain event fan-out.
//
// The engine publishes immutable event values; subscribers consume them and
// hold no references back into the chain. Events fire outside the store
// lock, after the state change they describe has been committed.

use crate::core::Transaction;
use crate::storage::StoredBlock;
use std::sync::{Arc, RwLock};

/// Where a transaction's containing block sits relative to the active chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    BestChain,
    SideChain,
}

/// Observer of chain-state changes.
///
/// Callbacks default to no-ops so implementations subscribe only to what
/// they need. A listener must not call back into the chain engine; it
/// receives finished snapshots.
pub trait ChainListener: Send + Sync {
    /// A block extended the best chain. Not called for the intermediate
    /// blocks of a reorganization; `reorganize` covers those.
    fn new_best_block(&self, _block: &StoredBlock) {}

    /// The active chain switched branches. `disconnected` holds the
    /// transactions of the abandoned blocks (tip first), `connected` the
    /// transactions of the newly active blocks in chain order.
    fn reorganize(
        &self,
        _old_tip: &StoredBlock,
        _new_tip: &StoredBlock,
        _disconnected: &[Transaction],
        _connected: &[Transaction],
    ) {
    }

    /// A transaction was observed in a connected block. `index` is its
    /// position within that block.
    fn transaction_in_block(
        &self,
        _tx: &Transaction,
        _block: &StoredBlock,
        _origin: BlockOrigin,
        _index: usize,
    ) {
    }
}

/// Copy-on-write listener set.
///
/// Registration clones the subscriber list, so firing never holds a lock
/// while user code runs.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<Arc<dyn ChainListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ChainListener>) {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.push(listener);
    }

    /// Current subscribers as an owned snapshot
    fn snapshot(&self) -> Vec<Arc<dyn ChainListener>> {
        self.listeners
            .read()
            .expect("listener registry poisoned")
            .clone()
    }

    pub fn notify_new_best_block(&self, block: &StoredBlock) {
        for listener in self.snapshot() {
            listener.new_best_block(block);
        }
    }

    pub fn notify_reorganize(
        &self,
        old_tip: &StoredBlock,
        new_tip: &StoredBlock,
        disconnected: &[Transaction],
        connected: &[Transaction],
    ) {
        for listener in self.snapshot() {
            listener.reorganize(old_tip, new_tip, disconnected, connected);
        }
    }

    pub fn notify_transaction_in_block(
        &self,
        tx: &Transaction,
        block: &StoredBlock,
        origin: BlockOrigin,
        index: usize,
    ) {
        for listener in self.snapshot() {
            listener.transaction_in_block(tx, block, origin, index);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .expect("listener registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
