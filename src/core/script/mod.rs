// Script engine: interprets the stack-based spend-authorization language

pub mod opcodes;

mod interpreter;
mod pattern;
mod sighash;

pub use interpreter::{
    eval_script, verify_script, ScriptError, SigVersion, SignatureChecker,
    TransactionSignatureChecker,
};
pub use pattern::{
    multisig_script, p2pk_script, p2pkh_script, p2pkh_script_sig, p2sh_script, p2wpkh_script,
    p2wsh_script, ScriptPattern,
};
pub use sighash::{
    legacy_signature_hash, witness_signature_hash, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE,
    SIGHASH_SINGLE,
};

/// Maximum serialized script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum combined depth of the main and alt stacks
pub const MAX_STACK_SIZE: usize = 1_000;

/// Maximum non-push operations per script
pub const MAX_OPS_PER_SCRIPT: usize = 201;

/// Maximum size of a single stack element
pub const MAX_ELEMENT_SIZE: usize = 520;

/// Maximum keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Script verification flags, combined by `|`. Which flags apply at a given
/// height is decided by the chain engine from the network's activation
/// heights.
pub mod flags {
    /// No optional checks
    pub const NONE: u32 = 0;
    /// Evaluate pay-to-script-hash redeem scripts (BIP-16)
    pub const P2SH: u32 = 1 << 0;
    /// Signatures must be strictly DER encoded (BIP-66)
    pub const STRICT_DER: u32 = 1 << 1;
    /// Signatures must use the low-S form
    pub const LOW_S: u32 = 1 << 2;
    /// OP_CHECKLOCKTIMEVERIFY is enforced (BIP-65)
    pub const CHECK_LOCKTIME: u32 = 1 << 3;
    /// OP_CHECKSEQUENCEVERIFY and relative lock-times are enforced (BIP-112)
    pub const CHECK_SEQUENCE: u32 = 1 << 4;
    /// Segregated-witness program execution (BIP-141/143)
    pub const WITNESS: u32 = 1 << 5;
    /// The scriptSig must contain only pushes
    pub const SIG_PUSH_ONLY: u32 = 1 << 6;
}
