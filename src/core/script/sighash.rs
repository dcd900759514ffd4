// Signature-hash algorithms: the legacy whole-transaction digest and the
// segregated-witness digest that commits to amount, outpoint, and sequence

use crate::core::serialize::{write_var_bytes, write_varint, Serializable};
use crate::core::{sha256d, Coin, Hash256, Transaction};

/// Sign all outputs
pub const SIGHASH_ALL: u32 = 0x01;
/// Sign no outputs
pub const SIGHASH_NONE: u32 = 0x02;
/// Sign only the output paired with this input
pub const SIGHASH_SINGLE: u32 = 0x03;
/// Combined with the above: commit to this input only
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

const BASE_TYPE_MASK: u32 = 0x1f;

/// The digest a legacy (pre-witness) signature commits to.
///
/// SIGHASH_SINGLE with an input index past the last output yields the
/// historical "one" digest rather than an error.
pub fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash256 {
    let base_type = hash_type & BASE_TYPE_MASK;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return Hash256::new(one);
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version.to_le_bytes());

    // Inputs
    if anyone_can_pay {
        write_varint(&mut buf, 1);
        let input = &tx.inputs[input_index];
        input.prevout.encode(&mut buf);
        write_var_bytes(&mut buf, script_code);
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    } else {
        write_varint(&mut buf, tx.inputs.len() as u64);
        for (i, input) in tx.inputs.iter().enumerate() {
            input.prevout.encode(&mut buf);
            if i == input_index {
                write_var_bytes(&mut buf, script_code);
            } else {
                write_varint(&mut buf, 0);
            }
            let sequence = if i != input_index && base_type != SIGHASH_ALL {
                0
            } else {
                input.sequence
            };
            buf.extend_from_slice(&sequence.to_le_bytes());
        }
    }

    // Outputs
    match base_type {
        SIGHASH_NONE => write_varint(&mut buf, 0),
        SIGHASH_SINGLE => {
            write_varint(&mut buf, input_index as u64 + 1);
            for (i, output) in tx.outputs.iter().take(input_index + 1).enumerate() {
                if i == input_index {
                    output.encode(&mut buf);
                } else {
                    // Nulled output: value -1, empty script
                    buf.extend_from_slice(&(-1i64).to_le_bytes());
                    write_varint(&mut buf, 0);
                }
            }
        }
        _ => {
            write_varint(&mut buf, tx.outputs.len() as u64);
            for output in &tx.outputs {
                output.encode(&mut buf);
            }
        }
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf.extend_from_slice(&hash_type.to_le_bytes());
    sha256d(&buf)
}

/// The witness digest: version ‖ hashPrevouts ‖ hashSequence ‖ outpoint ‖
/// scriptCode ‖ amount ‖ sequence ‖ hashOutputs ‖ lockTime ‖ hashType.
pub fn witness_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Coin,
    hash_type: u32,
) -> Hash256 {
    let base_type = hash_type & BASE_TYPE_MASK;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let input = &tx.inputs[input_index];

    let hash_prevouts = if anyone_can_pay {
        Hash256::zero()
    } else {
        let mut buf = Vec::new();
        for input in &tx.inputs {
            input.prevout.encode(&mut buf);
        }
        sha256d(&buf)
    };

    let hash_sequence = if anyone_can_pay || base_type != SIGHASH_ALL {
        Hash256::zero()
    } else {
        let mut buf = Vec::new();
        for input in &tx.inputs {
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        sha256d(&buf)
    };

    let hash_outputs = match base_type {
        SIGHASH_NONE => Hash256::zero(),
        SIGHASH_SINGLE => {
            if input_index < tx.outputs.len() {
                let mut buf = Vec::new();
                tx.outputs[input_index].encode(&mut buf);
                sha256d(&buf)
            } else {
                Hash256::zero()
            }
        }
        _ => {
            let mut buf = Vec::new();
            for output in &tx.outputs {
                output.encode(&mut buf);
            }
            sha256d(&buf)
        }
    };

    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version.to_le_bytes());
    buf.extend_from_slice(hash_prevouts.as_bytes());
    buf.extend_from_slice(hash_sequence.as_bytes());
    input.prevout.encode(&mut buf);
    write_var_bytes(&mut buf, script_code);
    buf.extend_from_slice(&amount.value.to_le_bytes());
    buf.extend_from_slice(&input.sequence.to_le_bytes());
    buf.extend_from_slice(hash_outputs.as_bytes());
    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf.extend_from_slice(&hash_type.to_le_bytes());
    sha256d(&buf)
}
