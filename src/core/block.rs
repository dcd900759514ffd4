// Block model: 80-byte headers, transaction lists, merkle roots

use crate::core::serialize::{
    read_hash, read_u32_le, read_varint, write_varint, CodecError, Serializable,
};
use crate::core::{sha256d, Hash256, Transaction};
use std::io::Cursor;

/// Serialized header length
pub const HEADER_SIZE: usize = 80;

/// Block header; its double-SHA-256 is the block identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block's header
    pub prev_block_hash: Hash256,
    /// Merkle root over the block's transaction IDs
    pub merkle_root: Hash256,
    /// Unix timestamp
    pub timestamp: u32,
    /// Difficulty target in compact form
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(
        version: u32,
        prev_block_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    /// Block identity: double SHA-256 of the 80 serialized bytes
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }
}

impl Serializable for BlockHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(HEADER_SIZE);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.prev_block_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let version = read_u32_le(cur)?;
        let prev_block_hash = read_hash(cur)?;
        let merkle_root = read_hash(cur)?;
        let timestamp = read_u32_le(cur)?;
        let bits = read_u32_le(cur)?;
        let nonce = read_u32_le(cur)?;
        Ok(Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        })
    }
}

/// A block: header plus ordered transactions, coinbase first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash.is_zero()
    }

    /// Merkle root over txids. Odd levels pair the last hash with itself.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        if transactions.is_empty() {
            return Hash256::zero();
        }

        let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();

        while hashes.len() > 1 {
            let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
            for chunk in hashes.chunks(2) {
                let left = chunk[0];
                let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
                let mut combined = Vec::with_capacity(64);
                combined.extend_from_slice(left.as_bytes());
                combined.extend_from_slice(right.as_bytes());
                next_level.push(sha256d(&combined));
            }
            hashes = next_level;
        }

        hashes[0]
    }
}

impl Serializable for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.header.encode(buf);
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(cur)?;
        let tx_count = read_varint(cur)?;
        let mut transactions = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(cur)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Headers on the wire are followed by a zero transaction count; decode one
/// such entry from a `headers` message payload.
pub fn decode_header_entry(cur: &mut Cursor<&[u8]>) -> Result<BlockHeader, CodecError> {
    let header = BlockHeader::decode(cur)?;
    let offset = cur.position();
    let tx_count = read_varint(cur)?;
    if tx_count != 0 {
        return Err(CodecError::malformed(
            offset,
            "headers entry carries transactions",
        ));
    }
    Ok(header)
}

/// Encode one `headers` message entry (header plus zero transaction count)
pub fn encode_header_entry(buf: &mut Vec<u8>, header: &BlockHeader) {
    header.encode(buf);
    write_varint(buf, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Coin, TxOutput};

    fn header() -> BlockHeader {
        BlockHeader::new(1, Hash256::zero(), Hash256::zero(), 1_234_567_890, 0x207fffff, 0)
    }

    #[test]
    fn test_header_serialization_is_80_bytes() {
        let bytes = header().serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = BlockHeader::deserialize(&bytes).unwrap();
        assert_eq!(header(), decoded);
    }

    #[test]
    fn test_header_hash_deterministic() {
        let h = header();
        assert_eq!(h.hash(), h.hash());
        let mut other = h;
        other.nonce += 1;
        assert_ne!(h.hash(), other.hash());
    }

    #[test]
    fn test_block_round_trip() {
        let coinbase = Transaction::coinbase(
            vec![1, 2, 3],
            vec![TxOutput::new(Coin::FIFTY_COINS, vec![0x51])],
        );
        let merkle = Block::calculate_merkle_root(std::slice::from_ref(&coinbase));
        let block = Block::new(
            BlockHeader::new(1, Hash256::zero(), merkle, 1_234_567_890, 0x207fffff, 7),
            vec![coinbase],
        );
        let bytes = block.serialize();
        let decoded = Block::deserialize(&bytes).unwrap();
        assert_eq!(block, decoded);
        assert_eq!(decoded.serialize(), bytes);
    }

    #[test]
    fn test_merkle_root_single_tx_is_txid() {
        let tx = Transaction::coinbase(vec![4, 5, 6], vec![TxOutput::new(Coin::COIN, vec![])]);
        assert_eq!(
            Block::calculate_merkle_root(std::slice::from_ref(&tx)),
            tx.txid()
        );
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let txs: Vec<Transaction> = (0u8..3)
            .map(|i| {
                Transaction::coinbase(vec![i], vec![TxOutput::new(Coin::COIN, vec![])])
            })
            .collect();
        let root = Block::calculate_merkle_root(&txs);

        // Level 1: H(t0||t1), H(t2||t2); level 2: H(ab||cc)
        let pair = |left: Hash256, right: Hash256| {
            let mut buf = Vec::new();
            buf.extend_from_slice(left.as_bytes());
            buf.extend_from_slice(right.as_bytes());
            sha256d(&buf)
        };
        let ab = pair(txs[0].txid(), txs[1].txid());
        let cc = pair(txs[2].txid(), txs[2].txid());
        assert_eq!(root, pair(ab, cc));
    }

    #[test]
    fn test_header_entry_rejects_transactions() {
        let mut buf = Vec::new();
        header().encode(&mut buf);
        write_varint(&mut buf, 1);
        let mut cur = Cursor::new(buf.as_slice());
        assert!(decode_header_entry(&mut cur).is_err());
    }
}
