// Context-free validity checks for transactions and blocks.
//
// Nothing here reads UTXO state; contextual rules (spentness, maturity,
// difficulty, median time) live in the chain engine.

use crate::consensus::params::{MAX_BLOCK_SIZE, MAX_FUTURE_DRIFT, MAX_MONEY};
use crate::consensus::pow::Target;
use crate::core::script::{ScriptError, MAX_SCRIPT_SIZE};
use crate::core::{Block, Coin, OutPoint, Serializable, Transaction};
use std::collections::HashSet;
use thiserror::Error;

/// A block or transaction violated a consensus rule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("bad structure: {0}")]
    BadStructure(&'static str),
    #[error("header hash does not meet its target")]
    BadPow,
    #[error("merkle root does not match the transactions")]
    BadMerkle,
    #[error("block timestamp {timestamp} is too far ahead of network time {now}")]
    FutureBlock { timestamp: u32, now: u32 },
    #[error("difficulty bits {got:#010x} do not match the expected {expected:#010x}")]
    BadDifficulty { expected: u32, got: u32 },
    #[error("block timestamp does not improve on the median of its ancestors")]
    BadTimestamp,
    #[error("outpoint {0:?} is spent twice")]
    DoubleSpend(OutPoint),
    #[error("no unspent output found for {0:?}")]
    MissingUtxo(OutPoint),
    #[error("coinbase spent at depth {depth}, maturity is {maturity}")]
    ImmatureCoinbase { depth: u32, maturity: u32 },
    #[error("monetary value out of range")]
    ValueOutOfRange,
    #[error("script verification failed on input {input}: {source}")]
    Script {
        input: usize,
        source: ScriptError,
    },
}

impl From<crate::core::CoinError> for VerificationError {
    fn from(_: crate::core::CoinError) -> Self {
        // Any amount arithmetic that wraps is outside valid money
        VerificationError::ValueOutOfRange
    }
}

/// Structural transaction rules: bounds, duplicate inputs, coinbase shape
pub fn check_transaction(tx: &Transaction) -> Result<(), VerificationError> {
    if tx.inputs.is_empty() {
        return Err(VerificationError::BadStructure("transaction has no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(VerificationError::BadStructure("transaction has no outputs"));
    }
    if tx.base_size() > MAX_BLOCK_SIZE {
        return Err(VerificationError::BadStructure("transaction exceeds block size"));
    }

    let mut total = Coin::ZERO;
    for output in &tx.outputs {
        if output.value.is_negative() || output.value.is_greater_than(MAX_MONEY) {
            return Err(VerificationError::ValueOutOfRange);
        }
        total = total.checked_add(output.value)?;
        if total.is_greater_than(MAX_MONEY) {
            return Err(VerificationError::ValueOutOfRange);
        }
        if output.script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(VerificationError::BadStructure("output script too large"));
        }
    }

    let mut seen: HashSet<OutPoint> = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(VerificationError::BadStructure("duplicate input"));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(VerificationError::BadStructure("coinbase script size"));
        }
    } else {
        for input in &tx.inputs {
            if input.prevout.is_null() {
                return Err(VerificationError::BadStructure("null outpoint"));
            }
        }
    }

    Ok(())
}

/// Structural block rules: proof of work, timestamp drift against the
/// supplied network-adjusted time, coinbase placement, merkle commitment.
pub fn check_block(block: &Block, network_time: u32) -> Result<(), VerificationError> {
    // Proof of work first: cheapest way to discard junk
    let target = Target::from_bits(block.header.bits);
    if !target.is_met_by(&block.hash()) {
        return Err(VerificationError::BadPow);
    }

    if block.header.timestamp > network_time.saturating_add(MAX_FUTURE_DRIFT) {
        return Err(VerificationError::FutureBlock {
            timestamp: block.header.timestamp,
            now: network_time,
        });
    }

    if block.transactions.is_empty() {
        return Err(VerificationError::BadStructure("block has no transactions"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(VerificationError::BadStructure("first transaction is not coinbase"));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(VerificationError::BadStructure("coinbase past first position"));
        }
    }

    if block.serialize().len() > MAX_BLOCK_SIZE {
        return Err(VerificationError::BadStructure("block exceeds size limit"));
    }

    if Block::calculate_merkle_root(&block.transactions) != block.header.merkle_root {
        return Err(VerificationError::BadMerkle);
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::NetworkParams;
    use crate::core::{BlockHeader, Hash256, TxInput, TxOutput};

    fn mine(header: &mut BlockHeader) {
        // Regtest difficulty falls within a few hundred attempts
        let target = Target::from_bits(header.bits);
        while !target.is_met_by(&header.hash()) {
            header.nonce += 1;
        }
    }

    fn valid_block(params: &NetworkParams) -> Block {
        let coinbase = Transaction::coinbase(
            vec![0x01, 0x00],
            vec![TxOutput::new(params.block_subsidy(1), vec![0x51])],
        );
        let merkle = Block::calculate_merkle_root(std::slice::from_ref(&coinbase));
        let mut header = BlockHeader::new(
            1,
            params.genesis_hash(),
            merkle,
            params.genesis_block().header.timestamp + 600,
            params.pow_limit_bits,
            0,
        );
        mine(&mut header);
        Block::new(header, vec![coinbase])
    }

    fn now_for(block: &Block) -> u32 {
        block.header.timestamp
    }

    #[test]
    fn test_valid_block_passes() {
        let params = NetworkParams::regtest();
        let block = valid_block(&params);
        check_block(&block, now_for(&block)).unwrap();
    }

    #[test]
    fn test_bad_pow_rejected() {
        let params = NetworkParams::regtest();
        let mut block = valid_block(&params);
        // A much harder target than the header's hash satisfies
        block.header.bits = 0x1d00ffff;
        assert_eq!(
            check_block(&block, now_for(&block)),
            Err(VerificationError::BadPow)
        );
    }

    #[test]
    fn test_future_block_rejected() {
        let params = NetworkParams::regtest();
        let block = valid_block(&params);
        let stale_now = block.header.timestamp - MAX_FUTURE_DRIFT - 1;
        assert!(matches!(
            check_block(&block, stale_now),
            Err(VerificationError::FutureBlock { .. })
        ));
    }

    #[test]
    fn test_bad_merkle_rejected() {
        let params = NetworkParams::regtest();
        let mut block = valid_block(&params);
        block.transactions.push(Transaction::new(
            vec![TxInput::new(OutPoint::new(Hash256::new([9; 32]), 0), vec![])],
            vec![TxOutput::new(Coin::from_sat(1), vec![])],
        ));
        mine(&mut block.header);
        assert_eq!(
            check_block(&block, now_for(&block)),
            Err(VerificationError::BadMerkle)
        );
    }

    #[test]
    fn test_coinbase_must_be_first_and_only() {
        let params = NetworkParams::regtest();
        let mut block = valid_block(&params);
        let extra_coinbase = Transaction::coinbase(
            vec![0x02, 0x01],
            vec![TxOutput::new(Coin::COIN, vec![])],
        );
        block.transactions.push(extra_coinbase);
        block.header.merkle_root = Block::calculate_merkle_root(&block.transactions);
        mine(&mut block.header);
        assert_eq!(
            check_block(&block, now_for(&block)),
            Err(VerificationError::BadStructure("coinbase past first position"))
        );
    }

    #[test]
    fn test_transaction_structure_rules() {
        // No inputs
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput::new(Coin::from_sat(1), vec![])],
            lock_time: 0,
        };
        assert!(check_transaction(&tx).is_err());

        // Duplicate inputs
        let point = OutPoint::new(Hash256::new([3; 32]), 1);
        let tx = Transaction::new(
            vec![TxInput::new(point, vec![]), TxInput::new(point, vec![])],
            vec![TxOutput::new(Coin::from_sat(1), vec![])],
        );
        assert_eq!(
            check_transaction(&tx),
            Err(VerificationError::BadStructure("duplicate input"))
        );

        // Null prevout outside a coinbase
        let tx = Transaction::new(
            vec![TxInput::new(OutPoint::null(), vec![])],
            vec![TxOutput::new(Coin::from_sat(1), vec![])],
        );
        // A single null-prevout input *is* the coinbase shape, so force two
        let tx = Transaction {
            inputs: vec![
                tx.inputs[0].clone(),
                TxInput::new(OutPoint::new(Hash256::new([1; 32]), 0), vec![]),
            ],
            ..tx
        };
        assert_eq!(
            check_transaction(&tx),
            Err(VerificationError::BadStructure("null outpoint"))
        );
    }

    #[test]
    fn test_value_bounds() {
        let input = TxInput::new(OutPoint::new(Hash256::new([5; 32]), 0), vec![]);
        let tx = Transaction::new(
            vec![input.clone()],
            vec![TxOutput::new(Coin::from_sat(-1), vec![])],
        );
        assert_eq!(check_transaction(&tx), Err(VerificationError::ValueOutOfRange));

        let tx = Transaction::new(
            vec![input.clone()],
            vec![TxOutput::new(
                MAX_MONEY.checked_add(Coin::SATOSHI).unwrap(),
                vec![],
            )],
        );
        assert_eq!(check_transaction(&tx), Err(VerificationError::ValueOutOfRange));

        // Two outputs that individually fit but sum past the cap
        let tx = Transaction::new(
            vec![input],
            vec![
                TxOutput::new(MAX_MONEY, vec![]),
                TxOutput::new(Coin::SATOSHI, vec![]),
            ],
        );
        assert_eq!(check_transaction(&tx), Err(VerificationError::ValueOutOfRange));
    }

    #[test]
    fn test_coinbase_script_bounds() {
        let coinbase = Transaction::coinbase(vec![], vec![TxOutput::new(Coin::COIN, vec![])]);
        assert_eq!(
            check_transaction(&coinbase),
            Err(VerificationError::BadStructure("coinbase script size"))
        );
        let coinbase =
            Transaction::coinbase(vec![0; 101], vec![TxOutput::new(Coin::COIN, vec![])]);
        assert!(check_transaction(&coinbase).is_err());
    }
}
