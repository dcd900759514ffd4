// Persistent chain state: headers, the UTXO set, and undo records.
//
// The chain engine is the single writer; everything else reads. A store
// implementation must make `apply_block`/`revert_block` atomic, so the
// chain head always agrees with the UTXO set.

mod sled_store;

pub use sled_store::SledChainStore;


use crate::consensus::pow::{Target, Uint256};
use crate::core::serialize::{
    read_bytes, read_u32_le, read_u8, read_varint, write_varint, CodecError, Serializable,
};
use crate::core::{Block, BlockHeader, Hash256, OutPoint, TxOutput};
use std::io::Cursor;
use thiserror::Error;

/// Storage failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage i/o: {0}")]
    Io(String),
    #[error("header {0} is already stored")]
    DuplicateHeader(Hash256),
    #[error("no undo data for height {0}")]
    UndoMissing(u32),
    #[error("outpoint {0:?} has no unspent entry")]
    MissingUtxo(OutPoint),
    #[error("outpoint {0:?} already exists unspent")]
    DoubleSpend(OutPoint),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// A header as persisted: its position and cumulative work on its branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub height: u32,
    /// Total work from genesis through this block
    pub chain_work: Uint256,
}

impl StoredBlock {
    /// Wrap a genesis header at height zero
    pub fn genesis(header: BlockHeader) -> Self {
        Self {
            chain_work: Target::from_bits(header.bits).block_work(),
            header,
            height: 0,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// The stored form of a child header on this branch
    pub fn build_next(&self, header: BlockHeader) -> Self {
        let work = Target::from_bits(header.bits).block_work();
        Self {
            header,
            height: self.height + 1,
            chain_work: self.chain_work.saturating_add(work),
        }
    }

    /// Whether this block has strictly more work than `other`
    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chain_work > other.chain_work
    }
}

impl Serializable for StoredBlock {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.header.encode(buf);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.chain_work.to_be_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(cur)?;
        let height = read_u32_le(cur)?;
        let work: [u8; 32] = read_bytes(cur)?;
        Ok(Self {
            header,
            height,
            chain_work: Uint256::from_be_bytes(&work),
        })
    }
}

/// One unspent output with the context its spend checks need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub output: TxOutput,
    /// Height of the block that created it
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn new(output: TxOutput, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }
}

impl Serializable for UtxoEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.output.encode(buf);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.push(self.is_coinbase as u8);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let output = TxOutput::decode(cur)?;
        let height = read_u32_le(cur)?;
        let is_coinbase = read_u8(cur)? != 0;
        Ok(Self {
            output,
            height,
            is_coinbase,
        })
    }
}

/// Spent entries of one transaction, in input order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxUndo {
    pub spent: Vec<UtxoEntry>,
}

/// Everything needed to take one block back out of the UTXO set.
/// Holds one record per non-coinbase transaction, in block order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl Serializable for BlockUndo {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.txs.len() as u64);
        for tx in &self.txs {
            write_varint(buf, tx.spent.len() as u64);
            for entry in &tx.spent {
                entry.encode(buf);
            }
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let tx_count = read_varint(cur)?;
        let mut txs = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            let spent_count = read_varint(cur)?;
            let mut spent = Vec::with_capacity(spent_count.min(4096) as usize);
            for _ in 0..spent_count {
                spent.push(UtxoEntry::decode(cur)?);
            }
            txs.push(TxUndo { spent });
        }
        Ok(Self { txs })
    }
}

/// The store contract the chain engine drives.
///
/// Mutators are atomic: a failed call leaves the store indistinguishable
/// from its pre-call state. `apply_block` and `revert_block` move the
/// chain head within the same transaction that touches the UTXO set.
pub trait ChainStore: Send {
    /// Persist a header record. Fails on a duplicate.
    fn put_header(&self, block: &StoredBlock) -> Result<(), StoreError>;

    /// Look up a header record by block hash
    fn get_header(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError>;

    /// Persist a header record together with its block body
    fn put_block(&self, stored: &StoredBlock, block: &Block) -> Result<(), StoreError>;

    /// Fetch a block body, if it is still within the pruning window
    fn block_body(&self, hash: &Hash256) -> Result<Option<Block>, StoreError>;

    /// Install the chain head reference without touching the UTXO set
    /// (bootstrap only)
    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError>;

    /// Hash of the current chain head, if one has been installed
    fn chain_head_hash(&self) -> Result<Option<Hash256>, StoreError>;

    /// The current chain head record.
    ///
    /// Panics if the store has a head hash with no matching header; that
    /// is a broken invariant, not a recoverable condition.
    fn get_chain_head(&self) -> Result<StoredBlock, StoreError> {
        let hash = self
            .chain_head_hash()?
            .expect("store has no chain head installed");
        let head = self.get_header(&hash)?;
        Ok(head.expect("chain head points at a missing header"))
    }

    /// Hash of the active-chain block at a height, if any
    fn hash_at_height(&self, height: u32) -> Result<Option<Hash256>, StoreError>;

    /// Connect a block: spend its inputs, create its outputs, record its
    /// undo data, advance the head. One atomic transaction.
    fn apply_block(
        &self,
        stored: &StoredBlock,
        block: &Block,
        undo: &BlockUndo,
    ) -> Result<(), StoreError>;

    /// Disconnect the current head block using its stored undo data and
    /// move the head to its parent. One atomic transaction.
    fn revert_block(&self, stored: &StoredBlock, block: &Block) -> Result<BlockUndo, StoreError>;

    /// Stored undo record for the active-chain block at a height
    fn get_undo(&self, height: u32) -> Result<Option<BlockUndo>, StoreError>;

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError>;

    fn has_utxo(&self, outpoint: &OutPoint) -> Result<bool, StoreError>;
}

/// Collect the undo record a block will need, given a resolver for the
/// entries its inputs consume. Entries appear in input order, one record
/// per non-coinbase transaction.
pub fn build_undo<F>(block: &Block, mut resolve: F) -> Result<BlockUndo, StoreError>
where
    F: FnMut(&OutPoint) -> Result<UtxoEntry, StoreError>,
{
    let mut txs = Vec::new();
    for tx in &block.transactions {
        if tx.is_coinbase() {
            continue;
        }
        let mut spent = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            spent.push(resolve(&input.prevout)?);
        }
        txs.push(TxUndo { spent });
    }
    Ok(BlockUndo { txs })
}
