//! Proof of work: compact difficulty, target checks, chain work and retargeting

use crate::config::ChainParams;
use crate::error::{ValidationError, ValidationKind};
use crate::hash::calculate_block_hash;
use crate::types::*;
use std::cmp::Ordering;
use std::fmt;

/// Hash function whose output is compared against the target
///
/// Networks differ in the function used here; the rest of the chain logic
/// (block identity, Merkle roots) always uses double SHA-256.
pub trait PowHash: Send + Sync {
    fn pow_hash(&self, header: &BlockHeader) -> Hash;
}

/// Double SHA-256 of the header, identical to the block hash
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256dPow;

impl PowHash for Sha256dPow {
    fn pow_hash(&self, header: &BlockHeader) -> Hash {
        calculate_block_hash(header)
    }
}

/// 256-bit unsigned integer for target and work arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256([u64; 4]); // 4 * 64 = 256 bits, least significant word first

impl U256 {
    pub fn zero() -> Self {
        U256([0; 4])
    }

    pub fn one() -> Self {
        U256([1, 0, 0, 0])
    }

    pub fn max_value() -> Self {
        U256([u64::MAX; 4])
    }

    pub fn from_u32(value: u32) -> Self {
        U256([value as u64, 0, 0, 0])
    }

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Position of the highest set bit plus one; zero for zero
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i >= word_shift + 1 {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    /// Wrapping addition
    pub fn add(&self, other: &U256) -> U256 {
        let mut result = U256::zero();
        let mut carry = false;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            result.0[i] = sum;
            carry = c1 || c2;
        }
        result
    }

    /// Wrapping subtraction
    pub fn sub(&self, other: &U256) -> U256 {
        let mut result = U256::zero();
        let mut borrow = false;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            result.0[i] = diff;
            borrow = b1 || b2;
        }
        result
    }

    pub fn not(&self) -> U256 {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    /// Wrapping multiplication by a 64-bit factor
    pub fn mul_u64(&self, factor: u64) -> U256 {
        let mut result = U256::zero();
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry;
            result.0[i] = product as u64;
            carry = product >> 64;
        }
        result
    }

    /// `self × mul / div` through a 320-bit intermediate, saturating at
    /// the maximum; division by zero yields zero
    pub fn mul_div_u64(&self, mul: u64, div: u64) -> U256 {
        if div == 0 {
            return U256::zero();
        }
        let mut wide = [0u64; 5];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = self.0[i] as u128 * mul as u128 + carry;
            wide[i] = product as u64;
            carry = product >> 64;
        }
        wide[4] = carry as u64;

        let mut quotient = [0u64; 5];
        let mut remainder: u128 = 0;
        for i in (0..5).rev() {
            let current = (remainder << 64) | wide[i] as u128;
            quotient[i] = (current / div as u128) as u64;
            remainder = current % div as u128;
        }
        if quotient[4] != 0 {
            return U256::max_value();
        }
        U256([quotient[0], quotient[1], quotient[2], quotient[3]])
    }

    /// Long division; division by zero yields zero
    pub fn div(&self, divisor: &U256) -> U256 {
        if divisor.is_zero() {
            return U256::zero();
        }
        let mut quotient = U256::zero();
        let mut remainder = U256::zero();
        for bit in (0..self.bits()).rev() {
            remainder = remainder.shl(1);
            if self.bit(bit) {
                remainder.0[0] |= 1;
            }
            if remainder >= *divisor {
                remainder = remainder.sub(divisor);
                quotient.0[(bit / 64) as usize] |= 1u64 << (bit % 64);
            }
        }
        quotient
    }

    fn bit(&self, index: u32) -> bool {
        (self.0[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    /// Little-endian byte form, the storage order of hashes
    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, &word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(chunk);
        }
        U256(words)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut be = self.to_le_bytes();
        be.reverse();
        write!(f, "{}", hex::encode(be))
    }
}

/// Decoded compact number, with the flags of the legacy format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    /// Mantissa sign bit set on a non-zero mantissa
    pub negative: bool,
    /// Value does not fit in 256 bits
    pub overflow: bool,
}

/// DecodeCompact: ℕ₃₂ → ℕ₂₅₆ × 𝔹 × 𝔹
///
/// Compact format is (exponent: 8 bits, mantissa: 24 bits):
/// 1. Target = mantissa × 256^(exponent − 3)
/// 2. Bit 0x00800000 is a sign bit; a set sign with non-zero mantissa is negative
/// 3. Any value needing more than 256 bits is flagged as overflow
pub fn decode_compact(bits: u32) -> CompactTarget {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    let target = if exponent <= 3 {
        U256::from_u32(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from_u32(mantissa).shl(8 * (exponent - 3))
    };
    let negative = mantissa != 0 && (bits & 0x0080_0000) != 0;
    let overflow = mantissa != 0
        && (exponent > 34
            || (mantissa > 0xff && exponent > 33)
            || (mantissa > 0xffff && exponent > 32));
    CompactTarget {
        target,
        negative,
        overflow,
    }
}

/// EncodeCompact: ℕ₂₅₆ → ℕ₃₂
///
/// Inverse of `decode_compact` for non-negative values: the mantissa is the
/// top three significant bytes, shifted down one byte more if its top bit
/// would read as a sign.
pub fn encode_compact(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact: u32 = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        target.shr(8 * (size - 3)).low_u64() as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// ExpandTarget: compact bits → usable target, rejecting negative,
/// overflowing and zero encodings
pub fn expand_target(bits: u32) -> Result<U256, ValidationError> {
    let decoded = decode_compact(bits);
    if decoded.negative {
        return Err(ValidationError::new(
            ValidationKind::ProofOfWork,
            "bad-diffbits",
            format!("negative compact target {bits:#010x}"),
        ));
    }
    if decoded.overflow {
        return Err(ValidationError::new(
            ValidationKind::ProofOfWork,
            "bad-diffbits",
            format!("compact target {bits:#010x} overflows"),
        ));
    }
    if decoded.target.is_zero() {
        return Err(ValidationError::new(
            ValidationKind::ProofOfWork,
            "bad-diffbits",
            format!("zero compact target {bits:#010x}"),
        ));
    }
    Ok(decoded.target)
}

/// CheckProofOfWork: ℍ × ℕ₃₂ → {valid, invalid}
///
/// 1. Target must decode cleanly and not exceed the network's limit
/// 2. The PoW hash, read as a 256-bit number, must not exceed the target
pub fn check_proof_of_work(pow_hash: &Hash, bits: u32, params: &ChainParams) -> Result<(), ValidationError> {
    let target = expand_target(bits)?;
    let limit = decode_compact(params.pow_limit_bits).target;
    if target > limit {
        return Err(ValidationError::new(
            ValidationKind::ProofOfWork,
            "bad-diffbits",
            format!("target {bits:#010x} above proof-of-work limit"),
        ));
    }
    if U256::from_le_bytes(pow_hash) > target {
        return Err(ValidationError::new(
            ValidationKind::ProofOfWork,
            "high-hash",
            "proof of work does not meet claimed target",
        ));
    }
    Ok(())
}

/// BlockWork: expected number of hashes to find a block at `bits`
///
/// work = 2²⁵⁶ / (target + 1), computed as (~target / (target + 1)) + 1
/// to stay within 256 bits. Invalid encodings carry no work.
pub fn block_work(bits: u32) -> U256 {
    match expand_target(bits) {
        Ok(target) => target.not().div(&target.add(&U256::one())).add(&U256::one()),
        Err(_) => U256::zero(),
    }
}

/// CalculateNextWorkRequired: retarget from the elapsed time of one interval
///
/// 1. actual = clamp(last_time − first_time, timespan / 4, timespan × 4)
/// 2. new = old_target × actual / timespan
/// 3. Cap at the proof-of-work limit
pub fn calculate_next_work_required(
    last_bits: u32,
    last_time: u32,
    first_time: u32,
    params: &ChainParams,
) -> u32 {
    let timespan = params.target_timespan as i64;
    let actual = (last_time as i64 - first_time as i64).clamp(timespan / 4, timespan * 4);

    let limit = decode_compact(params.pow_limit_bits).target;
    let mut target = decode_compact(last_bits)
        .target
        .mul_div_u64(actual as u64, timespan as u64);
    if target > limit {
        target = limit;
    }
    encode_compact(&target)
}
