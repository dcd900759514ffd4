// Recognized output-script templates and their builders.
//
// The matcher is a pure function over the pubkey script; the wallet signer
// uses it to decide how to satisfy an output, the engine uses it to route
// P2SH and witness spends.

use super::opcodes::*;

/// The standard output templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptPattern {
    /// `<pubkey> OP_CHECKSIG`
    P2pk { pubkey: Vec<u8> },
    /// `OP_DUP OP_HASH160 <hash20> OP_EQUALVERIFY OP_CHECKSIG`
    P2pkh { pubkey_hash: [u8; 20] },
    /// `OP_HASH160 <hash20> OP_EQUAL`
    P2sh { script_hash: [u8; 20] },
    /// `OP_0 <hash20>`
    P2wpkh { program: [u8; 20] },
    /// `OP_0 <hash32>`
    P2wsh { program: [u8; 32] },
    /// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`
    Multisig {
        required: usize,
        pubkeys: Vec<Vec<u8>>,
    },
    NonStandard,
}

impl ScriptPattern {
    /// Classify an output script against the standard templates
    pub fn classify(script: &[u8]) -> ScriptPattern {
        if let Some(hash) = match_p2pkh(script) {
            return ScriptPattern::P2pkh { pubkey_hash: hash };
        }
        if let Some(hash) = match_p2sh(script) {
            return ScriptPattern::P2sh { script_hash: hash };
        }
        if let Some(program) = match_witness_v0_20(script) {
            return ScriptPattern::P2wpkh { program };
        }
        if let Some(program) = match_witness_v0_32(script) {
            return ScriptPattern::P2wsh { program };
        }
        if let Some(pubkey) = match_p2pk(script) {
            return ScriptPattern::P2pk { pubkey };
        }
        if let Some((required, pubkeys)) = match_multisig(script) {
            return ScriptPattern::Multisig { required, pubkeys };
        }
        ScriptPattern::NonStandard
    }
}

fn match_p2pkh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return Some(hash);
    }
    None
}

fn match_p2sh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return Some(hash);
    }
    None
}

fn match_witness_v0_20(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 22 && script[0] == OP_0 && script[1] == 0x14 {
        let mut program = [0u8; 20];
        program.copy_from_slice(&script[2..]);
        return Some(program);
    }
    None
}

fn match_witness_v0_32(script: &[u8]) -> Option<[u8; 32]> {
    if script.len() == 34 && script[0] == OP_0 && script[1] == 0x20 {
        let mut program = [0u8; 32];
        program.copy_from_slice(&script[2..]);
        return Some(program);
    }
    None
}

fn is_pubkey_push(len: usize, data: &[u8]) -> bool {
    (len == 33 && (data[0] == 0x02 || data[0] == 0x03)) || (len == 65 && data[0] == 0x04)
}

fn match_p2pk(script: &[u8]) -> Option<Vec<u8>> {
    if script.len() < 2 || script[script.len() - 1] != OP_CHECKSIG {
        return None;
    }
    let push_len = script[0] as usize;
    if script.len() != push_len + 2 {
        return None;
    }
    let pubkey = &script[1..1 + push_len];
    if is_pubkey_push(push_len, pubkey) {
        return Some(pubkey.to_vec());
    }
    None
}

fn match_multisig(script: &[u8]) -> Option<(usize, Vec<Vec<u8>>)> {
    if script.len() < 4 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return None;
    }
    let m = small_int(script[0])?;
    let n = small_int(script[script.len() - 2])?;
    if m == 0 || m > n || n > 16 {
        return None;
    }

    let mut pubkeys = Vec::with_capacity(n);
    let mut pos = 1;
    let end = script.len() - 2;
    while pos < end {
        let push_len = script[pos] as usize;
        if !(1..=0x4b).contains(&push_len) || pos + 1 + push_len > end {
            return None;
        }
        let pubkey = &script[pos + 1..pos + 1 + push_len];
        if !is_pubkey_push(push_len, pubkey) {
            return None;
        }
        pubkeys.push(pubkey.to_vec());
        pos += 1 + push_len;
    }
    if pubkeys.len() != n {
        return None;
    }
    Some((m, pubkeys))
}

fn small_int(opcode: u8) -> Option<usize> {
    if (OP_1..=OP_16).contains(&opcode) {
        Some((opcode - OP_1 + 1) as usize)
    } else {
        None
    }
}

/// `<pubkey> OP_CHECKSIG`
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `OP_HASH160 <hash> OP_EQUAL`
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

/// `OP_0 <20-byte program>`
pub fn p2wpkh_script(program: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.push(OP_0);
    script.push(0x14);
    script.extend_from_slice(program);
    script
}

/// `OP_0 <32-byte program>`
pub fn p2wsh_script(program: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    script.push(OP_0);
    script.push(0x20);
    script.extend_from_slice(program);
    script
}

/// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`
pub fn multisig_script(required: usize, pubkeys: &[Vec<u8>]) -> Vec<u8> {
    debug_assert!(required >= 1 && required <= pubkeys.len() && pubkeys.len() <= 16);
    let mut script = Vec::new();
    script.push(encode_small_int(required as u8));
    for pubkey in pubkeys {
        script.push(pubkey.len() as u8);
        script.extend_from_slice(pubkey);
    }
    script.push(encode_small_int(pubkeys.len() as u8));
    script.push(OP_CHECKMULTISIG);
    script
}

/// `<signature> <pubkey>` unlocking script for a P2PKH output
pub fn p2pkh_script_sig(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(signature.len() + pubkey.len() + 2);
    script.push(signature.len() as u8);
    script.extend_from_slice(signature);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script
}
