// Hash primitives: double-SHA-256 and HASH160

use crate::core::Hash256;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Double SHA-256, the network's block/transaction identity hash
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256::new(out)
}

/// Single SHA-256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// RIPEMD160(SHA256(data)), the public-key and script hash
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripemd);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256d_deterministic() {
        let a = sha256d(b"hello world");
        let b = sha256d(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, sha256d(b"hello worle"));
    }

    #[test]
    fn test_sha256d_is_double_hash() {
        let inner = sha256(b"abc");
        let outer = sha256(&inner);
        assert_eq!(sha256d(b"abc").as_bytes(), &outer);
    }

    #[test]
    fn test_hash160_length() {
        assert_eq!(hash160(b"test data").len(), 20);
    }
}
