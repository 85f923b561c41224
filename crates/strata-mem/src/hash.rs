//! Byte-sequence hashing shared by both tables.
//!
//! FxHash is very fast on short identifiers but its output is weak in the
//! low bits, which is exactly what a power-of-two bucket mask consumes. The
//! result is therefore passed through the 64-bit MurmurHash3 finalizer.
//!
//! Hashes are stable within a process run only.

use std::hash::{Hash, Hasher};

use fxhash::FxHasher64;

/// Signature of a pluggable byte hash function.
pub type BytesHasher = fn(&[u8]) -> u64;

/// Hashes a byte sequence.
///
/// # Examples
///
/// ```
/// use strata_mem::hash::hash_bytes;
///
/// assert_eq!(hash_bytes(b"ident"), hash_bytes(b"ident"));
/// assert_ne!(hash_bytes(b"ident"), hash_bytes(b"idenu"));
/// ```
#[inline]
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher64::default();
    hasher.write(bytes);
    // Length separates prefixes that Fx would otherwise fold identically
    // (trailing zero bytes).
    hasher.write_usize(bytes.len());
    fmix64(hasher.finish())
}

/// Hashes any `Hash` value with the same mixing as [`hash_bytes`].
#[inline]
#[must_use]
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher64::default();
    value.hash(&mut hasher);
    fmix64(hasher.finish())
}

#[inline(always)]
const fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
