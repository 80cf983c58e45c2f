//! Digest and bit-level primitives for the XOR identifier space.
//!
//! Every identifier in the discovery protocol is a BLAKE2b-256 digest of a
//! public key; routing decisions are made on the XOR of two digests
//! interpreted as a big-endian unsigned integer. This module provides the
//! three operations everything else is built from:
//!
//! - [`hash`]: BLAKE2b-256 of an arbitrary byte string
//! - [`xor`]: elementwise XOR of two equal-length byte strings
//! - [`leading_zero_bits`]: MSB-first zero-bit count, clamped so that a
//!   digest of all zeros still maps to a valid bucket index

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// Width of the identifier digest in bytes.
pub const DIGEST_SIZE: usize = 32;

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b-256 digest of `bytes`.
pub fn hash(bytes: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// XOR applied to byte strings of different lengths.
///
/// This is a programmer error at the call site, not a recoverable network
/// condition, so it carries both widths for the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthMismatch {
    pub left: usize,
    pub right: usize,
}

impl std::fmt::Display for LengthMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "xor requires equal-length inputs, got {} and {} bytes",
            self.left, self.right
        )
    }
}

impl std::error::Error for LengthMismatch {}

/// Elementwise XOR of two equal-length byte strings.
pub fn xor(a: &[u8], b: &[u8]) -> Result<Vec<u8>, LengthMismatch> {
    if a.len() != b.len() {
        return Err(LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
}

/// Count MSB-first zero bits of `bytes`.
///
/// An all-zero input returns `8 * len - 1` rather than `8 * len`, keeping
/// the result usable as an index into `8 * len` distance buckets.
#[inline]
pub fn leading_zero_bits(bytes: &[u8]) -> usize {
    for (i, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    (bytes.len() * 8).saturating_sub(1)
}
