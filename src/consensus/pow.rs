// Proof-of-work targets, 256-bit work arithmetic, and difficulty retargets

use crate::consensus::params::NetworkParams;
use crate::core::Hash256;
use std::cmp::Ordering;
use std::fmt;

/// Unsigned 256-bit integer, little-endian 64-bit limbs.
///
/// Holds difficulty targets and cumulative chain work. Only the operations
/// the consensus code needs are implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uint256([u64; 4]);

impl Uint256 {
    pub const ZERO: Uint256 = Uint256([0; 4]);
    pub const ONE: Uint256 = Uint256([1, 0, 0, 0]);
    pub const MAX: Uint256 = Uint256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> Self {
        Uint256([value, 0, 0, 0])
    }

    /// Interpret 32 bytes as a little-endian number (hash byte order)
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *limb = u64::from_le_bytes(chunk);
        }
        Uint256(limbs)
    }

    /// Interpret 32 bytes as a big-endian number (stored-work byte order)
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut reversed = *bytes;
        reversed.reverse();
        Self::from_le_bytes(&reversed)
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            out[32 - (i + 1) * 8..32 - i * 8].copy_from_slice(&limb.to_be_bytes());
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 64] >> (index % 64) & 1 == 1
    }

    fn set_bit(&mut self, index: usize) {
        self.0[index / 64] |= 1 << (index % 64);
    }

    pub fn checked_add(self, other: Uint256) -> Option<Uint256> {
        let mut out = [0u64; 4];
        let mut carry = 0u64;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry);
            out[i] = sum;
            carry = (c1 as u64) + (c2 as u64);
        }
        if carry != 0 {
            return None;
        }
        Some(Uint256(out))
    }

    /// Addition that clamps at the maximum instead of wrapping
    pub fn saturating_add(self, other: Uint256) -> Uint256 {
        self.checked_add(other).unwrap_or(Uint256::MAX)
    }

    fn sub(self, other: Uint256) -> Uint256 {
        debug_assert!(self >= other);
        let mut out = [0u64; 4];
        let mut borrow = 0u64;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow);
            out[i] = diff;
            borrow = (b1 as u64) + (b2 as u64);
        }
        Uint256(out)
    }

    fn not(self) -> Uint256 {
        Uint256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    fn shl1(self) -> Uint256 {
        let mut out = [0u64; 4];
        let mut carry = 0u64;
        for i in 0..4 {
            out[i] = (self.0[i] << 1) | carry;
            carry = self.0[i] >> 63;
        }
        Uint256(out)
    }

    /// Shift left by whole bytes; `None` when bits would be lost
    fn checked_shl_bytes(self, bytes: u32) -> Option<Uint256> {
        let mut le = [0u8; 32];
        let be = self.to_be_bytes();
        for (i, b) in be.iter().rev().enumerate() {
            le[i] = *b;
        }
        let shift = bytes as usize;
        let mut out = [0u8; 32];
        for (i, b) in le.iter().enumerate() {
            if *b == 0 {
                continue;
            }
            if i + shift >= 32 {
                return None;
            }
            out[i + shift] = *b;
        }
        Some(Uint256::from_le_bytes(&out))
    }

    pub fn checked_mul_u64(self, factor: u64) -> Option<Uint256> {
        let mut out = [0u64; 4];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry;
            out[i] = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            return None;
        }
        Some(Uint256(out))
    }

    pub fn div_u64(self, divisor: u64) -> Uint256 {
        let mut out = [0u64; 4];
        let mut remainder: u128 = 0;
        for i in (0..4).rev() {
            let acc = (remainder << 64) | self.0[i] as u128;
            out[i] = (acc / divisor as u128) as u64;
            remainder = acc % divisor as u128;
        }
        Uint256(out)
    }

    /// Binary long division
    pub fn div(self, divisor: Uint256) -> Uint256 {
        debug_assert!(!divisor.is_zero());
        let mut quotient = Uint256::ZERO;
        let mut remainder = Uint256::ZERO;
        for i in (0..256).rev() {
            remainder = remainder.shl1();
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if remainder >= divisor {
                remainder = remainder.sub(divisor);
                quotient.set_bit(i);
            }
        }
        quotient
    }
}

impl PartialOrd for Uint256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uint256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..4).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_be_bytes()))
    }
}

/// Difficulty target in its compact (header `bits`) representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub bits: u32,
}

impl Target {
    pub fn from_bits(bits: u32) -> Self {
        Self { bits }
    }

    /// Expand the compact form. `None` for negative or overflowing encodings.
    pub fn to_uint256(self) -> Option<Uint256> {
        let exponent = self.bits >> 24;
        let mantissa = self.bits & 0x007f_ffff;
        if self.bits & 0x0080_0000 != 0 {
            // Sign bit set: negative target
            return None;
        }
        if exponent <= 3 {
            let value = mantissa >> (8 * (3 - exponent));
            return Some(Uint256::from_u64(value as u64));
        }
        Uint256::from_u64(mantissa as u64).checked_shl_bytes(exponent - 3)
    }

    /// Compress a 256-bit target back to compact form
    pub fn from_uint256(value: Uint256) -> Self {
        let be = value.to_be_bytes();
        let mut size = 32 - be.iter().take_while(|b| **b == 0).count();
        let mut mantissa: u32 = if size == 0 {
            0
        } else if size <= 3 {
            let mut v: u32 = 0;
            for b in &be[32 - size..] {
                v = (v << 8) | *b as u32;
            }
            v << (8 * (3 - size))
        } else {
            let start = 32 - size;
            u32::from_be_bytes([0, be[start], be[start + 1], be[start + 2]])
        };
        // Keep the sign bit clear in the mantissa
        if mantissa & 0x0080_0000 != 0 {
            mantissa >>= 8;
            size += 1;
        }
        Self {
            bits: ((size as u32) << 24) | mantissa,
        }
    }

    /// Whether a block hash satisfies this target
    pub fn is_met_by(self, hash: &Hash256) -> bool {
        match self.to_uint256() {
            Some(target) => Uint256::from_le_bytes(hash.as_bytes()) <= target,
            None => false,
        }
    }

    /// Expected work to produce one block at this target:
    /// `2^256 / (target + 1)`, computed as `~target / (target + 1) + 1`
    pub fn block_work(self) -> Uint256 {
        let target = match self.to_uint256() {
            Some(t) if !t.is_zero() => t,
            _ => return Uint256::ZERO,
        };
        let divisor = match target.checked_add(Uint256::ONE) {
            Some(d) => d,
            None => return Uint256::ZERO,
        };
        target
            .not()
            .div(divisor)
            .saturating_add(Uint256::ONE)
    }
}

/// Compute the compact target for the block after a retarget boundary.
///
/// `first_timestamp` is the timestamp of the first block of the closing
/// period, `last_timestamp`/`last_bits` come from the period's final block.
/// The adjustment is clamped to a factor of four in either direction.
pub fn next_retarget(
    params: &NetworkParams,
    first_timestamp: u32,
    last_timestamp: u32,
    last_bits: u32,
) -> u32 {
    let target_timespan = params.target_timespan();
    let mut actual = last_timestamp.saturating_sub(first_timestamp);
    if actual < target_timespan / 4 {
        actual = target_timespan / 4;
    }
    if actual > target_timespan * 4 {
        actual = target_timespan * 4;
    }

    let pow_limit = Target::from_bits(params.pow_limit_bits)
        .to_uint256()
        .unwrap_or(Uint256::MAX);
    let current = match Target::from_bits(last_bits).to_uint256() {
        Some(t) => t,
        None => return params.pow_limit_bits,
    };
    let adjusted = match current.checked_mul_u64(actual as u64) {
        Some(value) => value.div_u64(target_timespan as u64),
        None => pow_limit,
    };
    let clamped = if adjusted > pow_limit { pow_limit } else { adjusted };
    Target::from_uint256(clamped).bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint256_ordering() {
        let small = Uint256::from_u64(5);
        let large = Uint256::from_u64(6);
        assert!(small < large);
        let high_limb = Uint256([0, 0, 0, 1]);
        assert!(high_limb > large);
    }

    #[test]
    fn test_uint256_add_sub_round_trip() {
        let a = Uint256([u64::MAX, 1, 0, 0]);
        let b = Uint256::from_u64(12345);
        let sum = a.checked_add(b).unwrap();
        assert_eq!(sum.sub(b), a);
    }

    #[test]
    fn test_uint256_add_overflow() {
        assert_eq!(Uint256::MAX.checked_add(Uint256::ONE), None);
        assert_eq!(Uint256::MAX.saturating_add(Uint256::ONE), Uint256::MAX);
    }

    #[test]
    fn test_uint256_division() {
        let a = Uint256::from_u64(1_000_000);
        let b = Uint256::from_u64(1000);
        assert_eq!(a.div(b), Uint256::from_u64(1000));
        // (2^64) / 2 = 2^63
        let two_64 = Uint256([0, 1, 0, 0]);
        assert_eq!(two_64.div(Uint256::from_u64(2)), Uint256::from_u64(1 << 63));
    }

    #[test]
    fn test_uint256_be_bytes_round_trip() {
        let value = Uint256([0x0102030405060708, 0x1112131415161718, 0, 0x21]);
        assert_eq!(Uint256::from_be_bytes(&value.to_be_bytes()), value);
    }

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x207fffff, 0x1b0404cb, 0x1a05db8b] {
            let expanded = Target::from_bits(bits).to_uint256().unwrap();
            assert_eq!(Target::from_uint256(expanded).bits, bits);
        }
    }

    #[test]
    fn test_compact_small_values() {
        for v in [1u64, 0x80, 255, 0x8000, 0x123456] {
            let value = Uint256::from_u64(v);
            let bits = Target::from_uint256(value).bits;
            assert_eq!(Target::from_bits(bits).to_uint256().unwrap(), value);
        }
    }

    #[test]
    fn test_negative_compact_rejected() {
        assert_eq!(Target::from_bits(0x1d80ffff).to_uint256(), None);
    }

    #[test]
    fn test_target_met() {
        let easy = Target::from_bits(0x207fffff);
        // The all-zero hash satisfies any target
        assert!(easy.is_met_by(&Hash256::zero()));
        // The all-ones hash satisfies none
        assert!(!easy.is_met_by(&Hash256::new([0xff; 32])));
    }

    #[test]
    fn test_harder_target_means_more_work() {
        let easy = Target::from_bits(0x207fffff).block_work();
        let hard = Target::from_bits(0x1d00ffff).block_work();
        assert!(hard > easy);
        assert!(!easy.is_zero());
    }

    #[test]
    fn test_retarget_clamps() {
        let params = NetworkParams::mainnet();
        let timespan = params.target_timespan();
        // Blocks came exactly on schedule: difficulty unchanged
        let same = next_retarget(&params, 1_000_000, 1_000_000 + timespan, 0x1b0404cb);
        assert_eq!(same, 0x1b0404cb);

        // Far too fast: target shrinks by no more than 4x (modulo the
        // precision the compact form can carry)
        let fast = next_retarget(&params, 1_000_000, 1_000_000 + 1, 0x1b0404cb);
        let floor = Target::from_bits(0x1b0404cb)
            .to_uint256()
            .unwrap()
            .div_u64(4);
        assert_eq!(fast, Target::from_uint256(floor).bits);

        // Far too slow: target grows by no more than 4x
        let slow = next_retarget(&params, 1_000_000, 1_000_000 + timespan * 100, 0x1b0404cb);
        let slow_target = Target::from_bits(slow).to_uint256().unwrap();
        let ceiling = Target::from_bits(0x1b0404cb)
            .to_uint256()
            .unwrap()
            .checked_mul_u64(4)
            .unwrap();
        assert_eq!(slow_target, ceiling);
    }
}
