// Stack-machine script interpreter and the spend-verification pipeline

use super::opcodes::*;
use super::pattern::{p2pkh_script, ScriptPattern};
use super::sighash::{legacy_signature_hash, witness_signature_hash};
use super::{
    flags, MAX_ELEMENT_SIZE, MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG, MAX_SCRIPT_SIZE,
    MAX_STACK_SIZE,
};
use crate::core::{sha256, Coin, Hash256, Transaction, SEQUENCE_FINAL};
use crate::core::{SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG};
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Transactions with lock times below this are interpreted as block heights
const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// Script execution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("script exceeds {MAX_SCRIPT_SIZE} bytes")]
    ScriptSize,
    #[error("truncated push")]
    TruncatedPush,
    #[error("pushed element exceeds {MAX_ELEMENT_SIZE} bytes")]
    PushSize,
    #[error("more than {MAX_OPS_PER_SCRIPT} operations")]
    OpCount,
    #[error("stack depth exceeds {MAX_STACK_SIZE}")]
    StackSize,
    #[error("stack underflow")]
    InvalidStackOperation,
    #[error("disabled opcode 0x{0:02x}")]
    DisabledOpcode(u8),
    #[error("unknown opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("verify operation failed")]
    VerifyFailed,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("number is not minimally encoded")]
    NonMinimalNumber,
    #[error("number exceeds the 4-byte integer range")]
    NumberOverflow,
    #[error("signature is not strict DER")]
    SigDer,
    #[error("signature uses a high S value")]
    SigHighS,
    #[error("multisig public-key count out of range")]
    PubKeyCount,
    #[error("multisig signature count out of range")]
    SigCount,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("scriptSig must be push-only")]
    SigPushOnly,
    #[error("witness program hash mismatch")]
    WitnessProgramMismatch,
    #[error("malformed witness stack")]
    WitnessMalformed,
    #[error("witness provided for a non-witness output")]
    WitnessUnexpected,
    #[error("lock time requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("negative lock time")]
    NegativeLockTime,
}

/// Which signature-hash algorithm an executed script commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVersion {
    /// Legacy all-inputs hash
    Base,
    /// Segregated-witness digest committing to amount, outpoint, and
    /// sequence separately
    Witness,
}

/// Context the interpreter needs to judge CHECKSIG and lock-time opcodes
pub trait SignatureChecker {
    /// Verify a signature (with trailing hash-type byte) over the current
    /// script code. Encoding violations surface as errors, a merely wrong
    /// signature as `Ok(false)`.
    fn check_sig(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        sig_version: SigVersion,
        verify_flags: u32,
    ) -> Result<bool, ScriptError>;

    /// Whether the transaction satisfies an absolute lock-time requirement
    fn check_lock_time(&self, lock_time: i64) -> bool;

    /// Whether the input satisfies a relative lock-time requirement
    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker bound to one input of a transaction
pub struct TransactionSignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Value of the spent output, committed to by witness signatures
    pub amount: Coin,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: Coin) -> Self {
        Self {
            tx,
            input_index,
            amount,
        }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        sig_version: SigVersion,
        verify_flags: u32,
    ) -> Result<bool, ScriptError> {
        if sig.is_empty() {
            return Ok(false);
        }
        let (der, hash_type) = sig.split_at(sig.len() - 1);
        let hash_type = hash_type[0] as u32;

        let parsed = parse_signature(der, verify_flags)?;
        let signature = match parsed {
            Some(signature) => signature,
            None => return Ok(false),
        };
        let pubkey = match PublicKey::from_slice(pubkey) {
            Ok(pk) => pk,
            Err(_) => return Ok(false),
        };

        let digest = match sig_version {
            SigVersion::Base => {
                legacy_signature_hash(self.tx, self.input_index, script_code, hash_type)
            }
            SigVersion::Witness => witness_signature_hash(
                self.tx,
                self.input_index,
                script_code,
                self.amount,
                hash_type,
            ),
        };
        Ok(verify_digest(&digest, &signature, &pubkey))
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock = self.tx.lock_time as i64;
        // Height locks and time locks are incomparable
        if (tx_lock < LOCKTIME_THRESHOLD) != (lock_time < LOCKTIME_THRESHOLD) {
            return false;
        }
        if lock_time > tx_lock {
            return false;
        }
        // A final input never waits on a lock time
        self.tx.inputs[self.input_index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        if self.tx.version < 2 {
            return false;
        }
        let tx_sequence = self.tx.inputs[self.input_index].sequence as i64;
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let type_mask = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let value_mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let masked_tx = tx_sequence & value_mask;
        let masked_stack = sequence & value_mask;
        if (masked_tx & type_mask) != (masked_stack & type_mask) {
            return false;
        }
        masked_stack <= masked_tx
    }
}

fn parse_signature(der: &[u8], verify_flags: u32) -> Result<Option<Signature>, ScriptError> {
    let strict = verify_flags & flags::STRICT_DER != 0;
    let signature = if strict {
        match Signature::from_der(der) {
            Ok(sig) => sig,
            Err(_) => return Err(ScriptError::SigDer),
        }
    } else {
        match Signature::from_der_lax(der) {
            Ok(sig) => sig,
            Err(_) => return Ok(None),
        }
    };
    if verify_flags & flags::LOW_S != 0 {
        let mut normalized = signature;
        normalized.normalize_s();
        if normalized.serialize_compact() != signature.serialize_compact() {
            return Err(ScriptError::SigHighS);
        }
    }
    Ok(Some(signature))
}

fn verify_digest(digest: &Hash256, signature: &Signature, pubkey: &PublicKey) -> bool {
    let secp = Secp256k1::verification_only();
    let message = match Message::from_digest_slice(digest.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    // High-S signatures that passed the flag gate still verify
    let mut normalized = *signature;
    normalized.normalize_s();
    secp.verify_ecdsa(&message, &normalized, pubkey).is_ok()
}

/// Truthiness of a stack element: any non-zero byte, ignoring negative zero
fn cast_to_bool(data: &[u8]) -> bool {
    for (i, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(i == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Decode a minimally-encoded little-endian script number
fn decode_num(data: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::NumberOverflow);
    }
    if data.is_empty() {
        return Ok(0);
    }
    // Reject padded encodings: a top byte carrying only the sign bit is
    // redundant unless the byte below needs its high bit free.
    let last = data[data.len() - 1];
    if last & 0x7f == 0 && (data.len() == 1 || data[data.len() - 2] & 0x80 == 0) {
        return Err(ScriptError::NonMinimalNumber);
    }
    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= (*byte as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let sign_bit = 0x80i64 << (8 * (data.len() - 1));
        result = -(result & !sign_bit);
    }
    Ok(result)
}

/// Encode a script number in minimal little-endian form
fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().map_or(false, |b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

/// All operations in the script are pushes
pub(super) fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match read_push(script, &mut pc) {
            Ok(Some(_)) => {}
            Ok(None) => {
                // A non-push opcode; only small-int pushes qualify
                let opcode = script[pc];
                if decode_small_int(opcode).is_none() {
                    return false;
                }
                pc += 1;
            }
            Err(_) => return false,
        }
    }
    true
}

/// Collect the data pushed by a push-only script, in order
pub(super) fn collect_pushes(script: &[u8]) -> Result<Vec<Vec<u8>>, ScriptError> {
    let mut pc = 0;
    let mut pushes = Vec::new();
    while pc < script.len() {
        match read_push(script, &mut pc)? {
            Some(data) => pushes.push(data),
            None => {
                let opcode = script[pc];
                match decode_small_int(opcode) {
                    Some(n) => pushes.push(encode_num(n)),
                    None => return Err(ScriptError::SigPushOnly),
                }
                pc += 1;
            }
        }
    }
    Ok(pushes)
}

/// If the byte at `pc` starts an explicit push, consume it and return its
/// data; otherwise leave `pc` alone and return `None`.
fn read_push(script: &[u8], pc: &mut usize) -> Result<Option<Vec<u8>>, ScriptError> {
    let opcode = script[*pc];
    let (len, header) = match opcode {
        0x01..=0x4b => (opcode as usize, 1),
        OP_PUSHDATA1 => {
            let b = *script.get(*pc + 1).ok_or(ScriptError::TruncatedPush)?;
            (b as usize, 2)
        }
        OP_PUSHDATA2 => {
            if *pc + 3 > script.len() {
                return Err(ScriptError::TruncatedPush);
            }
            let b = u16::from_le_bytes([script[*pc + 1], script[*pc + 2]]);
            (b as usize, 3)
        }
        OP_PUSHDATA4 => {
            if *pc + 5 > script.len() {
                return Err(ScriptError::TruncatedPush);
            }
            let b = u32::from_le_bytes([
                script[*pc + 1],
                script[*pc + 2],
                script[*pc + 3],
                script[*pc + 4],
            ]);
            (b as usize, 5)
        }
        OP_0 => {
            *pc += 1;
            return Ok(Some(Vec::new()));
        }
        _ => return Ok(None),
    };
    let start = *pc + header;
    let end = start.checked_add(len).ok_or(ScriptError::TruncatedPush)?;
    if end > script.len() {
        return Err(ScriptError::TruncatedPush);
    }
    *pc = end;
    Ok(Some(script[start..end].to_vec()))
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn peek(stack: &[Vec<u8>], depth: usize) -> Result<&Vec<u8>, ScriptError> {
    if depth >= stack.len() {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - 1 - depth])
}

/// Execute one script over the given stack.
///
/// The final stack is left for the caller to judge; opcode failures,
/// resource-limit violations, and encoding violations surface as errors.
pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    verify_flags: u32,
    checker: &dyn SignatureChecker,
    sig_version: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut pc = 0usize;
    let mut op_count = 0usize;
    let mut last_separator = 0usize;
    let mut alt_stack: Vec<Vec<u8>> = Vec::new();
    // One bool per open IF/NOTIF: whether its taken branch is executing
    let mut exec_stack: Vec<bool> = Vec::new();

    while pc < script.len() {
        let executing = exec_stack.iter().all(|b| *b);
        let opcode = script[pc];

        if let Some(data) = read_push(script, &mut pc)? {
            if data.len() > MAX_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            if executing {
                stack.push(data);
            }
            check_stack_limit(stack, &alt_stack)?;
            continue;
        }
        pc += 1;

        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            // Disabled opcodes poison the script even in untaken branches
            return Err(ScriptError::DisabledOpcode(opcode));
        }
        if !executing && !matches!(opcode, OP_IF | OP_NOTIF | OP_ELSE | OP_ENDIF) {
            continue;
        }

        match opcode {
            OP_1NEGATE => stack.push(encode_num(-1)),
            OP_1..=OP_16 => stack.push(encode_num((opcode - OP_1 + 1) as i64)),

            OP_NOP | OP_NOP1 | 0xb3..=OP_NOP10 => {}

            OP_IF | OP_NOTIF => {
                let mut branch = false;
                if executing {
                    let condition = pop(stack)?;
                    branch = cast_to_bool(&condition);
                    if opcode == OP_NOTIF {
                        branch = !branch;
                    }
                }
                exec_stack.push(branch);
            }
            OP_ELSE => {
                let top = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *top = !*top;
            }
            OP_ENDIF => {
                exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }

            OP_VERIFY => {
                let top = pop(stack)?;
                if !cast_to_bool(&top) {
                    return Err(ScriptError::VerifyFailed);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            OP_TOALTSTACK => alt_stack.push(pop(stack)?),
            OP_FROMALTSTACK => {
                stack.push(alt_stack.pop().ok_or(ScriptError::InvalidStackOperation)?)
            }
            OP_2DROP => {
                pop(stack)?;
                pop(stack)?;
            }
            OP_2DUP => {
                let a = peek(stack, 1)?.clone();
                let b = peek(stack, 0)?.clone();
                stack.push(a);
                stack.push(b);
            }
            OP_3DUP => {
                let a = peek(stack, 2)?.clone();
                let b = peek(stack, 1)?.clone();
                let c = peek(stack, 0)?.clone();
                stack.push(a);
                stack.push(b);
                stack.push(c);
            }
            OP_2OVER => {
                let a = peek(stack, 3)?.clone();
                let b = peek(stack, 2)?.clone();
                stack.push(a);
                stack.push(b);
            }
            OP_2ROT => {
                if stack.len() < 6 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let idx = stack.len() - 6;
                let a = stack.remove(idx);
                let b = stack.remove(idx);
                stack.push(a);
                stack.push(b);
            }
            OP_2SWAP => {
                if stack.len() < 4 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let idx = stack.len() - 4;
                let a = stack.remove(idx);
                let b = stack.remove(idx);
                stack.push(a);
                stack.push(b);
            }
            OP_IFDUP => {
                let top = peek(stack, 0)?;
                if cast_to_bool(top) {
                    let dup = top.clone();
                    stack.push(dup);
                }
            }
            OP_DEPTH => {
                let depth = stack.len() as i64;
                stack.push(encode_num(depth));
            }
            OP_DROP => {
                pop(stack)?;
            }
            OP_DUP => stack.push(peek(stack, 0)?.clone()),
            OP_NIP => {
                let top = pop(stack)?;
                pop(stack)?;
                stack.push(top);
            }
            OP_OVER => stack.push(peek(stack, 1)?.clone()),
            OP_PICK | OP_ROLL => {
                let n = decode_num(&pop(stack)?, 4)?;
                if n < 0 || n as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let idx = stack.len() - 1 - n as usize;
                let item = if opcode == OP_ROLL {
                    stack.remove(idx)
                } else {
                    stack[idx].clone()
                };
                stack.push(item);
            }
            OP_ROT => {
                if stack.len() < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let idx = stack.len() - 3;
                let item = stack.remove(idx);
                stack.push(item);
            }
            OP_SWAP => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.swap(len - 1, len - 2);
            }
            OP_TUCK => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let top = peek(stack, 0)?.clone();
                let idx = stack.len() - 2;
                stack.insert(idx, top);
            }
            OP_SIZE => {
                let size = peek(stack, 0)?.len() as i64;
                stack.push(encode_num(size));
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                let a = pop(stack)?;
                let b = pop(stack)?;
                let equal = a == b;
                if opcode == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(if equal { vec![1] } else { vec![] });
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let value = decode_num(&pop(stack)?, 4)?;
                let result = match opcode {
                    OP_1ADD => value + 1,
                    OP_1SUB => value - 1,
                    OP_NEGATE => -value,
                    OP_ABS => value.abs(),
                    OP_NOT => (value == 0) as i64,
                    _ => (value != 0) as i64,
                };
                stack.push(encode_num(result));
            }
            OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
            | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
            | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let b = decode_num(&pop(stack)?, 4)?;
                let a = decode_num(&pop(stack)?, 4)?;
                let result = match opcode {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_BOOLAND => (a != 0 && b != 0) as i64,
                    OP_BOOLOR => (a != 0 || b != 0) as i64,
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                    OP_NUMNOTEQUAL => (a != b) as i64,
                    OP_LESSTHAN => (a < b) as i64,
                    OP_GREATERTHAN => (a > b) as i64,
                    OP_LESSTHANOREQUAL => (a <= b) as i64,
                    OP_GREATERTHANOREQUAL => (a >= b) as i64,
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(encode_num(result));
                }
            }
            OP_WITHIN => {
                let max = decode_num(&pop(stack)?, 4)?;
                let min = decode_num(&pop(stack)?, 4)?;
                let x = decode_num(&pop(stack)?, 4)?;
                stack.push(encode_num((min <= x && x < max) as i64));
            }

            OP_RIPEMD160 => {
                let data = pop(stack)?;
                stack.push(Ripemd160::digest(&data).to_vec());
            }
            OP_SHA256 => {
                let data = pop(stack)?;
                stack.push(sha256(&data).to_vec());
            }
            OP_HASH160 => {
                let data = pop(stack)?;
                stack.push(crate::core::hash160(&data).to_vec());
            }
            OP_HASH256 => {
                let data = pop(stack)?;
                let inner = Sha256::digest(&data);
                stack.push(Sha256::digest(inner).to_vec());
            }
            OP_CODESEPARATOR => last_separator = pc,

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = pop(stack)?;
                let sig = pop(stack)?;
                let script_code = &script[last_separator..];
                let valid = checker.check_sig(&sig, &pubkey, script_code, sig_version, verify_flags)?;
                if opcode == OP_CHECKSIGVERIFY {
                    if !valid {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(if valid { vec![1] } else { vec![] });
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let key_count = decode_num(&pop(stack)?, 4)?;
                if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
                    return Err(ScriptError::PubKeyCount);
                }
                op_count += key_count as usize;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
                let mut pubkeys = Vec::with_capacity(key_count as usize);
                for _ in 0..key_count {
                    pubkeys.push(pop(stack)?);
                }
                let sig_count = decode_num(&pop(stack)?, 4)?;
                if sig_count < 0 || sig_count > key_count {
                    return Err(ScriptError::SigCount);
                }
                let mut sigs = Vec::with_capacity(sig_count as usize);
                for _ in 0..sig_count {
                    sigs.push(pop(stack)?);
                }
                // Historical off-by-one: one extra element is consumed
                pop(stack)?;

                let script_code = &script[last_separator..];
                let mut sig_idx = 0usize;
                let mut key_idx = 0usize;
                let mut success = true;
                while sig_idx < sigs.len() {
                    if sigs.len() - sig_idx > pubkeys.len() - key_idx {
                        success = false;
                        break;
                    }
                    if checker.check_sig(
                        &sigs[sig_idx],
                        &pubkeys[key_idx],
                        script_code,
                        sig_version,
                        verify_flags,
                    )? {
                        sig_idx += 1;
                    }
                    key_idx += 1;
                    if key_idx == pubkeys.len() && sig_idx < sigs.len() {
                        success = false;
                        break;
                    }
                }
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(if success { vec![1] } else { vec![] });
                }
            }

            OP_CHECKLOCKTIMEVERIFY => {
                if verify_flags & flags::CHECK_LOCKTIME == 0 {
                    // Pre-activation this is a NOP
                    continue;
                }
                // Lock times exceed 4 bytes, so allow 5 here
                let lock_time = decode_num(peek(stack, 0)?, 5)?;
                if lock_time < 0 {
                    return Err(ScriptError::NegativeLockTime);
                }
                if !checker.check_lock_time(lock_time) {
                    return Err(ScriptError::UnsatisfiedLockTime);
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if verify_flags & flags::CHECK_SEQUENCE == 0 {
                    continue;
                }
                let sequence = decode_num(peek(stack, 0)?, 5)?;
                if sequence < 0 {
                    return Err(ScriptError::NegativeLockTime);
                }
                if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
                    // Disabled relative locks pass through
                    continue;
                }
                if !checker.check_sequence(sequence) {
                    return Err(ScriptError::UnsatisfiedLockTime);
                }
            }

            other => return Err(ScriptError::BadOpcode(other)),
        }

        check_stack_limit(stack, &alt_stack)?;
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn check_stack_limit(stack: &[Vec<u8>], alt_stack: &[Vec<u8>]) -> Result<(), ScriptError> {
    if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
        return Err(ScriptError::StackSize);
    }
    Ok(())
}

/// Verify that `script_sig` and `witness` authorize spending an output
/// locked by `script_pubkey`.
///
/// The pipeline: execute the scriptSig, snapshot the stack, execute the
/// scriptPubKey, and require a truthy top. Pay-to-script-hash outputs then
/// re-execute the popped redeem script, and witness programs route to the
/// segregated-witness path with the BIP-143 digest.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    verify_flags: u32,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if verify_flags & flags::SIG_PUSH_ONLY != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(script_sig, &mut stack, verify_flags, checker, SigVersion::Base)?;
    let stack_copy = stack.clone();

    eval_script(script_pubkey, &mut stack, verify_flags, checker, SigVersion::Base)?;
    if !stack.last().map_or(false, |top| cast_to_bool(top)) {
        return Err(ScriptError::EvalFalse);
    }

    if verify_flags & flags::WITNESS != 0 {
        if let Some(program) = WitnessProgram::parse(script_pubkey) {
            // A native witness spend carries everything in the witness
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalformed);
            }
            return verify_witness_program(&program, witness, verify_flags, checker);
        }
    }

    if verify_flags & flags::P2SH != 0
        && matches!(ScriptPattern::classify(script_pubkey), ScriptPattern::P2sh { .. })
    {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut stack = stack_copy;
        let redeem_script = pop(&mut stack)?;
        eval_script(&redeem_script, &mut stack, verify_flags, checker, SigVersion::Base)?;
        if !stack.last().map_or(false, |top| cast_to_bool(top)) {
            return Err(ScriptError::EvalFalse);
        }
        if verify_flags & flags::WITNESS != 0 {
            if let Some(program) = WitnessProgram::parse(&redeem_script) {
                // Wrapped witness: the scriptSig must be exactly the
                // redeem-script push
                let pushes = collect_pushes(script_sig)?;
                if pushes.len() != 1 || pushes[0] != redeem_script {
                    return Err(ScriptError::WitnessMalformed);
                }
                return verify_witness_program(&program, witness, verify_flags, checker);
            }
        }
        if !witness.is_empty() {
            return Err(ScriptError::WitnessUnexpected);
        }
        return Ok(());
    }

    if !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }
    Ok(())
}

/// Version-0 witness program parsed out of an output script
struct WitnessProgram {
    program: Vec<u8>,
}

impl WitnessProgram {
    fn parse(script: &[u8]) -> Option<Self> {
        match ScriptPattern::classify(script) {
            ScriptPattern::P2wpkh { program } => Some(Self {
                program: program.to_vec(),
            }),
            ScriptPattern::P2wsh { program } => Some(Self {
                program: program.to_vec(),
            }),
            _ => None,
        }
    }
}

fn verify_witness_program(
    witness_program: &WitnessProgram,
    witness: &[Vec<u8>],
    verify_flags: u32,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let (script, mut stack): (Vec<u8>, Vec<Vec<u8>>) = match witness_program.program.len() {
        20 => {
            // Pay-to-witness-public-key-hash: exactly signature and key
            if witness.len() != 2 {
                return Err(ScriptError::WitnessMalformed);
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&witness_program.program);
            (p2pkh_script(&hash), witness.to_vec())
        }
        32 => {
            // Pay-to-witness-script-hash: last element is the script
            let (witness_script, rest) = witness
                .split_last()
                .ok_or(ScriptError::WitnessMalformed)?;
            if sha256(witness_script) != witness_program.program.as_slice() {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (witness_script.clone(), rest.to_vec())
        }
        _ => return Err(ScriptError::WitnessMalformed),
    };

    for element in &stack {
        if element.len() > MAX_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
    }
    eval_script(&script, &mut stack, verify_flags, checker, SigVersion::Witness)?;
    if stack.len() != 1 || !cast_to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}
