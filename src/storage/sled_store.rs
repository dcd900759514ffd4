// Sled-backed chain store.
//
// One database holds every record family, distinguished by a key prefix, so
// a single `sled::Batch` can mutate headers, UTXOs, undo data, and the
// chain head atomically:
//
//   'h' + block hash   -> StoredBlock
//   'b' + block hash   -> block body
//   'u' + outpoint     -> UtxoEntry
//   'U' + height (BE)  -> BlockUndo
//   'H' + height (BE)  -> active-chain block hash
//   "meta/head"        -> chain head hash

use crate::core::{Block, Hash256, OutPoint, Serializable};
use crate::storage::{BlockUndo, ChainStore, StoreError, StoredBlock, UtxoEntry};
use sled::{Batch, Db};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const KEY_HEAD: &[u8] = b"meta/head";

pub struct SledChainStore {
    db: Db,
    /// Undo data and bodies older than this many blocks are discarded
    prune_depth: u32,
}

impl SledChainStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P, prune_depth: u32) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db, prune_depth })
    }

    /// Ephemeral store for tests
    pub fn temporary(prune_depth: u32) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, prune_depth })
    }

    fn header_key(hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b'h');
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn body_key(hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b'b');
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn utxo_key(outpoint: &OutPoint) -> Vec<u8> {
        let mut key = Vec::with_capacity(37);
        key.push(b'u');
        key.extend_from_slice(&outpoint.to_key());
        key
    }

    fn undo_key(height: u32) -> [u8; 5] {
        let mut key = [0u8; 5];
        key[0] = b'U';
        key[1..].copy_from_slice(&height.to_be_bytes());
        key
    }

    fn height_key(height: u32) -> [u8; 5] {
        let mut key = [0u8; 5];
        key[0] = b'H';
        key[1..].copy_from_slice(&height.to_be_bytes());
        key
    }

    fn read_hash(data: &[u8]) -> Result<Hash256, StoreError> {
        Hash256::from_slice(data).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Queue removal of undo data and bodies that fell out of the reorg
    /// window once the head reaches `head_height`.
    fn queue_pruning(&self, batch: &mut Batch, head_height: u32) -> Result<(), StoreError> {
        if head_height < self.prune_depth {
            return Ok(());
        }
        let prune_height = head_height - self.prune_depth;
        batch.remove(Self::undo_key(prune_height).as_slice());
        if let Some(hash) = self.db.get(Self::height_key(prune_height))? {
            batch.remove(Self::body_key(&Self::read_hash(&hash)?));
        }
        Ok(())
    }
}

impl ChainStore for SledChainStore {
    fn put_header(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let key = Self::header_key(&block.hash());
        if self.db.contains_key(&key)? {
            return Err(StoreError::DuplicateHeader(block.hash()));
        }
        self.db.insert(key, block.serialize())?;
        Ok(())
    }

    fn get_header(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        match self.db.get(Self::header_key(hash))? {
            Some(data) => Ok(Some(StoredBlock::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn put_block(&self, stored: &StoredBlock, block: &Block) -> Result<(), StoreError> {
        let hash = stored.hash();
        self.db.insert(Self::header_key(&hash), stored.serialize())?;
        self.db.insert(Self::body_key(&hash), block.serialize())?;
        Ok(())
    }

    fn block_body(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        match self.db.get(Self::body_key(hash))? {
            Some(data) => Ok(Some(Block::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError> {
        self.db
            .insert(KEY_HEAD, block.hash().as_bytes().as_slice())?;
        self.db
            .insert(Self::height_key(block.height), block.hash().as_bytes().as_slice())?;
        self.db.flush()?;
        Ok(())
    }

    fn chain_head_hash(&self) -> Result<Option<Hash256>, StoreError> {
        match self.db.get(KEY_HEAD)? {
            Some(data) => Ok(Some(Self::read_hash(&data)?)),
            None => Ok(None),
        }
    }

    fn hash_at_height(&self, height: u32) -> Result<Option<Hash256>, StoreError> {
        match self.db.get(Self::height_key(height))? {
            Some(data) => Ok(Some(Self::read_hash(&data)?)),
            None => Ok(None),
        }
    }

    fn apply_block(
        &self,
        stored: &StoredBlock,
        block: &Block,
        undo: &BlockUndo,
    ) -> Result<(), StoreError> {
        let hash = stored.hash();
        let mut batch = Batch::default();

        // Outputs created then consumed inside this block never hit disk
        let mut created: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut consumed: HashSet<OutPoint> = HashSet::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let outpoint = input.prevout;
                    if consumed.contains(&outpoint) {
                        return Err(StoreError::DoubleSpend(outpoint));
                    }
                    if created.remove(&outpoint).is_none() {
                        if !self.db.contains_key(Self::utxo_key(&outpoint))? {
                            return Err(StoreError::MissingUtxo(outpoint));
                        }
                        batch.remove(Self::utxo_key(&outpoint));
                    }
                    consumed.insert(outpoint);
                }
            }
            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, vout as u32);
                if self.db.contains_key(Self::utxo_key(&outpoint))? {
                    // An identical unspent coin already exists; overwriting
                    // it would make it unspendable once
                    return Err(StoreError::DoubleSpend(outpoint));
                }
                created.insert(
                    outpoint,
                    UtxoEntry::new(output.clone(), stored.height, tx.is_coinbase()),
                );
            }
        }
        for (outpoint, entry) in &created {
            batch.insert(Self::utxo_key(outpoint), entry.serialize());
        }

        batch.insert(Self::header_key(&hash), stored.serialize());
        batch.insert(Self::body_key(&hash), block.serialize());
        batch.insert(Self::undo_key(stored.height).as_slice(), undo.serialize());
        batch.insert(
            Self::height_key(stored.height).as_slice(),
            hash.as_bytes().as_slice(),
        );
        batch.insert(KEY_HEAD, hash.as_bytes().as_slice());
        self.queue_pruning(&mut batch, stored.height)?;

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn revert_block(&self, stored: &StoredBlock, block: &Block) -> Result<BlockUndo, StoreError> {
        let undo = self
            .get_undo(stored.height)?
            .ok_or(StoreError::UndoMissing(stored.height))?;

        let mut batch = Batch::default();
        let mut undo_iter = undo.txs.iter().rev();

        // Walk the block backwards: drop each transaction's outputs, then
        // restore what it spent. Outpoints both created and spent inside
        // the block cancel out in batch order.
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for vout in 0..tx.outputs.len() {
                batch.remove(Self::utxo_key(&OutPoint::new(txid, vout as u32)));
            }
            if tx.is_coinbase() {
                continue;
            }
            let tx_undo = undo_iter
                .next()
                .ok_or_else(|| StoreError::Corrupt("undo record too short".into()))?;
            if tx_undo.spent.len() != tx.inputs.len() {
                return Err(StoreError::Corrupt("undo entry count mismatch".into()));
            }
            for (input, entry) in tx.inputs.iter().zip(&tx_undo.spent) {
                batch.insert(Self::utxo_key(&input.prevout), entry.serialize());
            }
        }

        batch.remove(Self::undo_key(stored.height).as_slice());
        batch.remove(Self::height_key(stored.height).as_slice());
        batch.insert(KEY_HEAD, stored.header.prev_block_hash.as_bytes().as_slice());

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(undo)
    }

    fn get_undo(&self, height: u32) -> Result<Option<BlockUndo>, StoreError> {
        match self.db.get(Self::undo_key(height))? {
            Some(data) => Ok(Some(BlockUndo::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        match self.db.get(Self::utxo_key(outpoint))? {
            Some(data) => Ok(Some(UtxoEntry::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn has_utxo(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(Self::utxo_key(outpoint))?)
    }
}
