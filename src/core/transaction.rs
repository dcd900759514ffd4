// Transaction model: outpoints, inputs, outputs, witness data

use crate::core::serialize::{
    read_i32_le, read_u32_le, read_u64_le, read_var_bytes, read_varint, read_hash, write_var_bytes,
    write_varint, CodecError, Serializable,
};
use crate::core::{sha256d, Coin, CoinError, Hash256};
use std::io::Cursor;

/// Sequence number of a final input
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Set in a sequence number to opt out of relative lock-time
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// Set when a relative lock-time is in 512-second units rather than blocks
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// Low 16 bits of a sequence number hold the relative lock value
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Granularity of time-based relative locks, in seconds
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Reference to a transaction output: (txid, output index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The sentinel outpoint carried by coinbase inputs
    pub fn null() -> Self {
        Self {
            txid: Hash256::zero(),
            vout: 0xffff_ffff,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == 0xffff_ffff
    }

    /// Fixed 36-byte form used as a database key
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.vout.to_le_bytes());
        key
    }

    /// Parse the 36-byte database-key form
    pub fn from_key(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != 36 {
            return Err(CodecError::malformed(0, "outpoint key must be 36 bytes"));
        }
        let mut cur = Cursor::new(bytes);
        Self::decode(&mut cur)
    }
}

impl Serializable for OutPoint {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.txid.as_bytes());
        buf.extend_from_slice(&self.vout.to_le_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let txid = read_hash(cur)?;
        let vout = read_u32_le(cur)?;
        Ok(Self { txid, vout })
    }
}

/// Transaction input: spends a previous output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// The output being spent
    pub prevout: OutPoint,
    /// Unlocking script (scriptSig)
    pub script_sig: Vec<u8>,
    /// Sequence number, also carries relative lock-times
    pub sequence: u32,
    /// Witness stack; empty for non-segwit spends
    pub witness: Vec<Vec<u8>>,
}

impl TxInput {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }

    /// Coinbase input: null outpoint, arbitrary script
    pub fn coinbase(script_sig: Vec<u8>) -> Self {
        Self {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.prevout.is_null()
    }
}

impl Serializable for TxInput {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.prevout.encode(buf);
        write_var_bytes(buf, &self.script_sig);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let prevout = OutPoint::decode(cur)?;
        let script_sig = read_var_bytes(cur)?;
        let sequence = read_u32_le(cur)?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

/// Transaction output: an amount locked by a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: Coin,
    /// Locking script (scriptPubKey)
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: Coin, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

impl Serializable for TxOutput {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.value.to_le_bytes());
        write_var_bytes(buf, &self.script_pubkey);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let value = Coin::from_sat(read_u64_le(cur)? as i64);
        let script_pubkey = read_var_bytes(cur)?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A transaction: versioned lists of inputs and outputs plus a lock time.
///
/// Two serializations exist. The base form skips witness data and defines
/// the txid; the witness form inserts a zero marker and a flag byte after
/// the version and appends one witness stack per input before the lock
/// time, and defines the wtxid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Build a coinbase transaction for the given height's reward
    pub fn coinbase(script_sig: Vec<u8>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs: vec![TxInput::coinbase(script_sig)],
            outputs,
            lock_time: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Transaction ID: double SHA-256 of the base (non-witness) serialization
    pub fn txid(&self) -> Hash256 {
        let mut buf = Vec::new();
        self.encode_base(&mut buf);
        sha256d(&buf)
    }

    /// Witness transaction ID; equals the txid for non-witness transactions
    pub fn wtxid(&self) -> Hash256 {
        if !self.has_witness() {
            return self.txid();
        }
        sha256d(&self.serialize())
    }

    /// Sum of output values
    pub fn total_output_value(&self) -> Result<Coin, CoinError> {
        let mut total = Coin::ZERO;
        for output in &self.outputs {
            total = total.checked_add(output.value)?;
        }
        Ok(total)
    }

    /// Size of the base serialization in bytes
    pub fn base_size(&self) -> usize {
        let mut buf = Vec::new();
        self.encode_base(&mut buf);
        buf.len()
    }

    /// Size of the full serialization (witness form when present)
    pub fn total_size(&self) -> usize {
        self.serialize().len()
    }

    fn encode_base(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(buf);
        }
        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(buf);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

impl Serializable for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        if !self.has_witness() {
            self.encode_base(buf);
            return;
        }
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(0x00); // marker
        buf.push(0x01); // flag
        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(buf);
        }
        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(buf);
        }
        for input in &self.inputs {
            write_varint(buf, input.witness.len() as u64);
            for item in &input.witness {
                write_var_bytes(buf, item);
            }
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let version = read_i32_le(cur)?;

        // A zero "input count" is the segwit marker; the real count follows
        // the flag byte.
        let marker_pos = cur.position();
        let mut segwit = false;
        let mut input_count = read_varint(cur)?;
        if input_count == 0 {
            let flag = read_varint(cur)?;
            if flag != 1 {
                return Err(CodecError::malformed(marker_pos, "bad segwit flag"));
            }
            segwit = true;
            input_count = read_varint(cur)?;
        }
        if input_count == 0 {
            return Err(CodecError::malformed(marker_pos, "transaction has no inputs"));
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            inputs.push(TxInput::decode(cur)?);
        }

        let output_count = read_varint(cur)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            outputs.push(TxOutput::decode(cur)?);
        }

        if segwit {
            for input in &mut inputs {
                let items = read_varint(cur)?;
                let mut witness = Vec::with_capacity(items.min(256) as usize);
                for _ in 0..items {
                    witness.push(read_var_bytes(cur)?);
                }
                input.witness = witness;
            }
        }

        let lock_time = read_u32_le(cur)?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction::new(
            vec![TxInput::new(
                OutPoint::new(Hash256::new([9; 32]), 1),
                vec![0x51],
            )],
            vec![TxOutput::new(Coin::from_sat(1000), vec![0x51])],
        )
    }

    #[test]
    fn test_null_outpoint() {
        let null = OutPoint::null();
        assert!(null.is_null());
        assert!(!OutPoint::new(Hash256::new([1; 32]), 0).is_null());
        // Zero hash with a real index is not the sentinel
        assert!(!OutPoint::new(Hash256::zero(), 0).is_null());
    }

    #[test]
    fn test_outpoint_key_round_trip() {
        let outpoint = OutPoint::new(Hash256::new([7; 32]), 42);
        let key = outpoint.to_key();
        assert_eq!(OutPoint::from_key(&key).unwrap(), outpoint);
    }

    #[test]
    fn test_coinbase_detection() {
        let coinbase = Transaction::coinbase(
            vec![1, 2, 3],
            vec![TxOutput::new(Coin::FIFTY_COINS, vec![])],
        );
        assert!(coinbase.is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn test_base_round_trip() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let decoded = Transaction::deserialize(&bytes).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(decoded.serialize(), bytes);
    }

    #[test]
    fn test_witness_round_trip() {
        let mut tx = sample_tx();
        tx.inputs[0].witness = vec![vec![1, 2, 3], vec![4, 5]];
        let bytes = tx.serialize();
        // Witness form carries the marker/flag pair after the version
        assert_eq!(bytes[4], 0x00);
        assert_eq!(bytes[5], 0x01);
        let decoded = Transaction::deserialize(&bytes).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(decoded.serialize(), bytes);
    }

    #[test]
    fn test_txid_ignores_witness() {
        let mut tx = sample_tx();
        let txid_before = tx.txid();
        tx.inputs[0].witness = vec![vec![0xaa; 72]];
        assert_eq!(tx.txid(), txid_before);
        assert_ne!(tx.wtxid(), tx.txid());
    }

    #[test]
    fn test_wtxid_equals_txid_without_witness() {
        let tx = sample_tx();
        assert_eq!(tx.wtxid(), tx.txid());
    }

    #[test]
    fn test_total_output_value_overflow() {
        let tx = Transaction::new(
            vec![TxInput::new(OutPoint::new(Hash256::new([1; 32]), 0), vec![])],
            vec![
                TxOutput::new(Coin::from_sat(i64::MAX), vec![]),
                TxOutput::new(Coin::from_sat(1), vec![]),
            ],
        );
        assert_eq!(tx.total_output_value(), Err(CoinError::Overflow));
    }

    #[test]
    fn test_decode_rejects_empty_inputs() {
        let tx = sample_tx();
        let mut bytes = tx.serialize();
        // Zero the input count; without a valid flag byte this is malformed
        bytes[4] = 0;
        bytes[5] = 0xee;
        assert!(Transaction::deserialize(&bytes).is_err());
    }
}
