// The chain engine: accepts blocks, extends or reorganizes the active
// chain, and drives full contextual validation.
//
// Logically single-threaded: callers serialize through one engine value
// (the network layer wraps it in a mutex). All state mutation goes through
// the store's atomic mutators, so a failure at any point leaves the chain
// head and UTXO set consistent.

use crate::consensus::params::{NetworkParams, MEDIAN_TIME_SPAN};
use crate::consensus::pow::next_retarget;
use crate::consensus::validation::{check_block, VerificationError};
use crate::core::script::{verify_script, ScriptError, TransactionSignatureChecker};
use crate::core::{
    Block, Coin, Hash256, OutPoint, Transaction, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_GRANULARITY, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use crate::events::{BlockOrigin, ChainListener, ListenerRegistry};
use crate::storage::{BlockUndo, ChainStore, StoreError, StoredBlock, TxUndo, UtxoEntry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Orphan blocks buffered while their parents are missing
const MAX_ORPHAN_BLOCKS: usize = 100;

/// Absolute lock-times below this are block heights, above it timestamps
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Outcome of offering a block to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddBlockResult {
    /// The block is the new chain head (by extension or reorganization)
    NewBest,
    /// Valid but on a branch with no more work than the active one
    SideChain,
    /// Already known; nothing changed
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    /// The parent is unknown; the block is buffered and retried once the
    /// parent arrives
    #[error("orphan block {hash}: parent {missing_parent} not found")]
    Orphan {
        hash: Hash256,
        missing_parent: Hash256,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reorganization depth {depth} exceeds the undo window of {max}")]
    ReorgTooDeep { depth: u32, max: u32 },
}

/// Source of "network adjusted time" for the future-block check
pub type Clock = Arc<dyn Fn() -> u32 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    })
}

pub struct ChainEngine<S: ChainStore> {
    params: NetworkParams,
    store: S,
    listeners: ListenerRegistry,
    /// Bounded pool of blocks waiting for their parent, keyed by own hash
    orphans: HashMap<Hash256, Block>,
    /// Insertion order for eviction
    orphan_order: Vec<Hash256>,
    clock: Clock,
}

impl<S: ChainStore> ChainEngine<S> {
    /// Create an engine over a store, installing the genesis block if the
    /// store is empty.
    pub fn new(params: NetworkParams, store: S) -> Result<Self, ChainError> {
        if store.chain_head_hash()?.is_none() {
            let genesis = params.genesis_block();
            let stored = StoredBlock::genesis(genesis.header);
            store.apply_block(&stored, &genesis, &BlockUndo::default())?;
            log::info!("installed genesis block {}", stored.hash());
        }
        Ok(Self {
            params,
            store,
            listeners: ListenerRegistry::new(),
            orphans: HashMap::new(),
            orphan_order: Vec::new(),
            clock: system_clock(),
        })
    }

    /// Replace the network-time source (tests)
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn register_listener(&self, listener: Arc<dyn ChainListener>) {
        self.listeners.register(listener);
    }

    pub fn chain_head(&self) -> Result<StoredBlock, ChainError> {
        Ok(self.store.get_chain_head()?)
    }

    /// Whether the engine already holds this block, either in the store or
    /// in the orphan pool
    pub fn is_known(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.orphans.contains_key(hash) || self.store.get_header(hash)?.is_some())
    }

    /// Offer a block to the engine.
    ///
    /// Orphans are buffered (bounded) and reported as [`ChainError::Orphan`];
    /// once their parent connects they are retried automatically.
    pub fn add_block(&mut self, block: Block) -> Result<AddBlockResult, ChainError> {
        let result = self.accept_block(block)?;
        if result != AddBlockResult::Unchanged {
            self.connect_orphans()?;
        }
        Ok(result)
    }

    fn accept_block(&mut self, block: Block) -> Result<AddBlockResult, ChainError> {
        let hash = block.hash();

        if self.store.get_header(&hash)?.is_some() {
            return Ok(AddBlockResult::Unchanged);
        }

        check_block(&block, (self.clock)())?;

        let parent = match self.store.get_header(&block.header.prev_block_hash)? {
            Some(parent) => parent,
            None => {
                let missing_parent = block.header.prev_block_hash;
                self.stash_orphan(hash, block);
                return Err(ChainError::Orphan {
                    hash,
                    missing_parent,
                });
            }
        };

        self.check_contextual_header(&block, &parent)?;

        let stored = parent.build_next(block.header);
        let head = self.store.get_chain_head()?;

        if parent.hash() == head.hash() {
            self.connect_block(&stored, &block)?;
            log::info!("new best block {} at height {}", hash, stored.height);
            self.listeners.notify_new_best_block(&stored);
            self.notify_transactions(&block, &stored, BlockOrigin::BestChain);
            return Ok(AddBlockResult::NewBest);
        }

        if stored.more_work_than(&head) {
            log::info!(
                "block {} (height {}) has more work than the tip, reorganizing",
                hash,
                stored.height
            );
            self.reorganize(&head, &stored, &block)?;
            return Ok(AddBlockResult::NewBest);
        }

        // Equal or less work: first seen wins, the branch is only recorded
        self.store.put_block(&stored, &block)?;
        log::debug!("side-chain block {} at height {}", hash, stored.height);
        self.notify_transactions(&block, &stored, BlockOrigin::SideChain);
        Ok(AddBlockResult::SideChain)
    }

    /// Height, difficulty, and median-time rules that need the parent
    fn check_contextual_header(
        &self,
        block: &Block,
        parent: &StoredBlock,
    ) -> Result<(), ChainError> {
        let expected = self.expected_bits(parent)?;
        if block.header.bits != expected {
            return Err(VerificationError::BadDifficulty {
                expected,
                got: block.header.bits,
            }
            .into());
        }
        let median = self.median_time_past(parent)?;
        if block.header.timestamp <= median {
            return Err(VerificationError::BadTimestamp.into());
        }
        Ok(())
    }

    /// Compact difficulty the child of `parent` must carry
    fn expected_bits(&self, parent: &StoredBlock) -> Result<u32, ChainError> {
        if self.params.no_retargeting {
            return Ok(self.params.pow_limit_bits);
        }
        let height = parent.height + 1;
        if height % self.params.retarget_interval != 0 {
            return Ok(parent.header.bits);
        }
        // Walk back to the first block of the closing period
        let first_height = height - self.params.retarget_interval;
        let mut cursor = parent.clone();
        while cursor.height > first_height {
            cursor = self
                .store
                .get_header(&cursor.header.prev_block_hash)?
                .expect("header chain has a gap below a stored block");
        }
        Ok(next_retarget(
            &self.params,
            cursor.header.timestamp,
            parent.header.timestamp,
            parent.header.bits,
        ))
    }

    /// Median timestamp of the last `MEDIAN_TIME_SPAN` blocks ending at
    /// `tip`
    fn median_time_past(&self, tip: &StoredBlock) -> Result<u32, ChainError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = tip.clone();
        loop {
            times.push(cursor.header.timestamp);
            if times.len() == MEDIAN_TIME_SPAN || cursor.height == 0 {
                break;
            }
            cursor = self
                .store
                .get_header(&cursor.header.prev_block_hash)?
                .expect("header chain has a gap below a stored block");
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    fn stash_orphan(&mut self, hash: Hash256, block: Block) {
        if self.orphans.contains_key(&hash) {
            return;
        }
        while self.orphans.len() >= MAX_ORPHAN_BLOCKS {
            let oldest = self.orphan_order.remove(0);
            self.orphans.remove(&oldest);
            log::debug!("orphan pool full, evicted {}", oldest);
        }
        log::debug!("buffered orphan block {}", hash);
        self.orphans.insert(hash, block);
        self.orphan_order.push(hash);
    }

    /// Retry buffered orphans until no more connect
    fn connect_orphans(&mut self) -> Result<(), ChainError> {
        loop {
            let mut connected_any = false;
            let candidates: Vec<Hash256> = self
                .orphans
                .iter()
                .filter_map(|(hash, block)| {
                    match self.store.get_header(&block.header.prev_block_hash) {
                        Ok(Some(_)) => Some(*hash),
                        _ => None,
                    }
                })
                .collect();
            for hash in candidates {
                let block = match self.orphans.remove(&hash) {
                    Some(block) => block,
                    None => continue,
                };
                self.orphan_order.retain(|h| *h != hash);
                match self.accept_block(block) {
                    Ok(_) => connected_any = true,
                    Err(ChainError::Store(e)) => return Err(ChainError::Store(e)),
                    Err(err) => {
                        // A bad orphan is simply dropped
                        log::warn!("buffered orphan {} rejected: {}", hash, err);
                    }
                }
            }
            if !connected_any {
                return Ok(());
            }
        }
    }

    /// Full contextual validation of `block` against the current UTXO set,
    /// then one atomic apply. The caller guarantees the block's parent is
    /// the current chain head.
    fn connect_block(&self, stored: &StoredBlock, block: &Block) -> Result<(), ChainError> {
        let undo = self.validate_block_spends(stored, block)?;
        self.store.apply_block(stored, block, &undo)?;
        Ok(())
    }

    /// The expensive part of block connection: resolve every spend, enforce
    /// maturity/lock/value rules, run every input script, and produce the
    /// undo record. Touches no state.
    fn validate_block_spends(
        &self,
        stored: &StoredBlock,
        block: &Block,
    ) -> Result<BlockUndo, ChainError> {
        let height = stored.height;
        let script_flags = self.params.script_flags(height);

        let mut created: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let mut fees = Coin::ZERO;
        let mut undo_txs: Vec<TxUndo> = Vec::new();

        for tx in &block.transactions {
            if !self.is_final(tx, height, block.header.timestamp) {
                return Err(VerificationError::BadStructure("non-final transaction").into());
            }

            if tx.is_coinbase() {
                self.register_outputs(tx, height, &mut created);
                continue;
            }

            let mut input_total = Coin::ZERO;
            let mut spent_entries = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                let outpoint = input.prevout;
                if spent.contains(&outpoint) {
                    return Err(VerificationError::DoubleSpend(outpoint).into());
                }
                let entry = match created.get(&outpoint) {
                    Some(entry) => entry.clone(),
                    None => self
                        .store
                        .get_utxo(&outpoint)?
                        .ok_or(VerificationError::MissingUtxo(outpoint))?,
                };
                if entry.is_coinbase {
                    let depth = height - entry.height;
                    if depth < self.params.coinbase_maturity {
                        return Err(VerificationError::ImmatureCoinbase {
                            depth,
                            maturity: self.params.coinbase_maturity,
                        }
                        .into());
                    }
                }
                input_total = input_total
                    .checked_add(entry.output.value)
                    .map_err(VerificationError::from)?;
                spent.insert(outpoint);
                spent_entries.push(entry);
            }

            let output_total = tx.total_output_value().map_err(VerificationError::from)?;
            if output_total.is_greater_than(input_total) {
                return Err(VerificationError::ValueOutOfRange.into());
            }
            fees = fees
                .checked_add(
                    input_total
                        .checked_sub(output_total)
                        .map_err(VerificationError::from)?,
                )
                .map_err(VerificationError::from)?;

            if self.params.sequence_locks_active(height) {
                self.check_sequence_locks(tx, &spent_entries, stored)?;
            }

            for (input_index, (input, entry)) in
                tx.inputs.iter().zip(&spent_entries).enumerate()
            {
                let checker =
                    TransactionSignatureChecker::new(tx, input_index, entry.output.value);
                verify_script(
                    &input.script_sig,
                    &entry.output.script_pubkey,
                    &input.witness,
                    script_flags,
                    &checker,
                )
                .map_err(|source| VerificationError::Script {
                    input: input_index,
                    source,
                })?;
            }

            undo_txs.push(TxUndo {
                spent: spent_entries,
            });
            self.register_outputs(tx, height, &mut created);
        }

        // Coinbase may claim the subsidy plus collected fees, nothing more
        let max_coinbase = self
            .params
            .block_subsidy(height)
            .checked_add(fees)
            .map_err(VerificationError::from)?;
        let coinbase_total = block.transactions[0]
            .total_output_value()
            .map_err(VerificationError::from)?;
        if coinbase_total.is_greater_than(max_coinbase) {
            return Err(VerificationError::ValueOutOfRange.into());
        }

        Ok(BlockUndo { txs: undo_txs })
    }

    fn register_outputs(
        &self,
        tx: &Transaction,
        height: u32,
        created: &mut HashMap<OutPoint, UtxoEntry>,
    ) {
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            created.insert(
                OutPoint::new(txid, vout as u32),
                UtxoEntry::new(output.clone(), height, tx.is_coinbase()),
            );
        }
    }

    /// Absolute lock-time finality at the block being built
    fn is_final(&self, tx: &Transaction, height: u32, block_time: u32) -> bool {
        if tx.lock_time == 0 {
            return true;
        }
        let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            block_time
        };
        if tx.lock_time < cutoff {
            return true;
        }
        tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }

    /// Relative lock-times per consumed output (BIP-68 semantics)
    fn check_sequence_locks(
        &self,
        tx: &Transaction,
        spent_entries: &[UtxoEntry],
        stored: &StoredBlock,
    ) -> Result<(), ChainError> {
        if tx.version < 2 {
            return Ok(());
        }
        for (input_index, (input, entry)) in tx.inputs.iter().zip(spent_entries).enumerate() {
            if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
                continue;
            }
            let value = input.sequence & SEQUENCE_LOCKTIME_MASK;
            let violated = if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
                // Time-based: measured from the median time of the block
                // before the one that created the output
                let coin_time = self.median_time_at(entry.height.saturating_sub(1))?;
                let lock_seconds = (value as u64) << SEQUENCE_LOCKTIME_GRANULARITY;
                let parent = self
                    .store
                    .get_header(&stored.header.prev_block_hash)?
                    .expect("parent of a connecting block is stored");
                (self.median_time_past(&parent)? as u64) < coin_time as u64 + lock_seconds
            } else {
                stored.height < entry.height + value
            };
            if violated {
                return Err(VerificationError::Script {
                    input: input_index,
                    source: ScriptError::UnsatisfiedLockTime,
                }
                .into());
            }
        }
        Ok(())
    }

    fn median_time_at(&self, height: u32) -> Result<u32, ChainError> {
        let hash = self
            .store
            .hash_at_height(height)?
            .expect("active chain has no gap");
        let stored = self
            .store
            .get_header(&hash)?
            .expect("height index points at a stored header");
        self.median_time_past(&stored)
    }

    /// Switch the active chain to the branch ending in `candidate`.
    ///
    /// Walks both branches to the fork, disconnects the old side with its
    /// undo data, then connects the new side under full validation. A
    /// failure on the new side restores the old branch before reporting.
    fn reorganize(
        &mut self,
        old_head: &StoredBlock,
        candidate: &StoredBlock,
        candidate_block: &Block,
    ) -> Result<(), ChainError> {
        // Collect the new branch back to the fork point
        let mut new_branch: Vec<(StoredBlock, Block)> =
            vec![(candidate.clone(), candidate_block.clone())];
        let mut cursor = self
            .store
            .get_header(&candidate.header.prev_block_hash)?
            .expect("parent of an accepted block is stored");
        while !self.on_active_chain(&cursor)? {
            let body = self
                .store
                .block_body(&cursor.hash())?
                .ok_or_else(|| StoreError::Corrupt("side-chain body missing".into()))?;
            new_branch.push((cursor.clone(), body));
            cursor = self
                .store
                .get_header(&cursor.header.prev_block_hash)?
                .expect("side chain does not reach the active chain");
        }
        let ancestor = cursor;

        let depth = old_head.height - ancestor.height;
        if depth > self.params.max_reorg_depth {
            log::error!(
                "refusing reorganization of depth {} (window {}), manual intervention may be needed",
                depth,
                self.params.max_reorg_depth
            );
            return Err(ChainError::ReorgTooDeep {
                depth,
                max: self.params.max_reorg_depth,
            });
        }

        // Disconnect the old branch, tip first
        let mut disconnected: Vec<(StoredBlock, Block)> = Vec::new();
        let mut cursor = old_head.clone();
        while cursor.height > ancestor.height {
            let body = self
                .store
                .block_body(&cursor.hash())?
                .ok_or_else(|| StoreError::Corrupt("active-chain body missing".into()))?;
            self.store.revert_block(&cursor, &body)?;
            let parent = self
                .store
                .get_header(&cursor.header.prev_block_hash)?
                .expect("active chain reaches the fork point");
            disconnected.push((cursor, body));
            cursor = parent;
        }

        // Connect the new branch, fork first
        new_branch.reverse();
        for i in 0..new_branch.len() {
            let (stored, block) = &new_branch[i];
            if let Err(err) = self.connect_block(stored, block) {
                log::warn!(
                    "reorganization aborted at {} (height {}): {}",
                    stored.hash(),
                    stored.height,
                    err
                );
                self.rollback_reorg(&new_branch[..i], &disconnected)?;
                return Err(err);
            }
        }

        let disconnected_txs: Vec<Transaction> = disconnected
            .iter()
            .flat_map(|(_, block)| block.transactions.iter().cloned())
            .collect();
        let connected_txs: Vec<Transaction> = new_branch
            .iter()
            .flat_map(|(_, block)| block.transactions.iter().cloned())
            .collect();
        log::info!(
            "reorganized: {} -> {} (disconnected {}, connected {})",
            old_head.hash(),
            candidate.hash(),
            disconnected.len(),
            new_branch.len()
        );
        for (stored, block) in &new_branch {
            self.notify_transactions(block, stored, BlockOrigin::BestChain);
        }
        self.listeners
            .notify_reorganize(old_head, candidate, &disconnected_txs, &connected_txs);
        Ok(())
    }

    /// Undo a partially applied reorganization: peel off what connected,
    /// then reinstate the previously active branch.
    fn rollback_reorg(
        &self,
        connected: &[(StoredBlock, Block)],
        disconnected: &[(StoredBlock, Block)],
    ) -> Result<(), ChainError> {
        for (stored, block) in connected.iter().rev() {
            self.store.revert_block(stored, block)?;
        }
        // `disconnected` is tip-first; reapply bottom-up
        for (stored, block) in disconnected.iter().rev() {
            self.reapply_block(stored, block)?;
        }
        Ok(())
    }

    /// Re-apply a block that was valid when first connected, rebuilding its
    /// undo record from the present UTXO set. No re-validation.
    fn reapply_block(&self, stored: &StoredBlock, block: &Block) -> Result<(), ChainError> {
        let mut created: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut undo_txs: Vec<TxUndo> = Vec::new();
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                let mut spent = Vec::with_capacity(tx.inputs.len());
                for input in &tx.inputs {
                    let entry = match created.get(&input.prevout) {
                        Some(entry) => entry.clone(),
                        None => self
                            .store
                            .get_utxo(&input.prevout)?
                            .ok_or(VerificationError::MissingUtxo(input.prevout))?,
                    };
                    spent.push(entry);
                }
                undo_txs.push(TxUndo { spent });
            }
            self.register_outputs(tx, stored.height, &mut created);
        }
        self.store
            .apply_block(stored, block, &BlockUndo { txs: undo_txs })?;
        Ok(())
    }

    fn on_active_chain(&self, stored: &StoredBlock) -> Result<bool, StoreError> {
        Ok(self.store.hash_at_height(stored.height)? == Some(stored.hash()))
    }

    fn notify_transactions(&self, block: &Block, stored: &StoredBlock, origin: BlockOrigin) {
        for (index, tx) in block.transactions.iter().enumerate() {
            self.listeners
                .notify_transaction_in_block(tx, stored, origin, index);
        }
    }

    /// Sparse locator over the active chain: dense near the tip, thinning
    /// geometrically back to genesis
    pub fn block_locator(&self) -> Result<Vec<Hash256>, ChainError> {
        let head = self.store.get_chain_head()?;
        let mut hashes = Vec::new();
        let mut height = head.height as i64;
        let mut step: i64 = 1;
        while height > 0 {
            let hash = self
                .store
                .hash_at_height(height as u32)?
                .expect("active chain has no gap");
            hashes.push(hash);
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.params.genesis_hash());
        Ok(hashes)
    }

    /// Serve a `getheaders` request: active-chain headers after the first
    /// locator entry we recognize, up to `max` of them or `stop`.
    pub fn headers_after(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        max: usize,
    ) -> Result<Vec<crate::core::BlockHeader>, ChainError> {
        let mut start_height = 0;
        for hash in locator {
            if let Some(stored) = self.store.get_header(hash)? {
                if self.on_active_chain(&stored)? {
                    start_height = stored.height;
                    break;
                }
            }
        }
        let mut headers = Vec::new();
        let mut height = start_height + 1;
        while headers.len() < max {
            let hash = match self.store.hash_at_height(height)? {
                Some(hash) => hash,
                None => break,
            };
            let stored = self
                .store
                .get_header(&hash)?
                .expect("height index points at a stored header");
            headers.push(stored.header);
            if hash == *stop {
                break;
            }
            height += 1;
        }
        Ok(headers)
    }

    /// Fetch a block body for serving `getdata`
    pub fn block_body(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        Ok(self.store.block_body(hash)?)
    }
}
