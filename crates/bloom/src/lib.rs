//! # Bloom filter
//!
//! A compact probabilistic set used to skip SSTables during point lookups.
//!
//! The contract is one-sided: a key that was added always answers "maybe
//! present"; a key that was never added *usually* answers "not present".
//! False positives cost one wasted table probe, false negatives would lose
//! data — so the latter are impossible by construction.
//!
//! ## Hashing
//!
//! Double hashing over a single 128-bit [`xxh3_128`] digest: the low and high
//! halves serve as `h1` and `h2`, and the `i`-th probe sets bit
//! `(h1 + i*h2) mod bits`. When `h2` comes out zero it is replaced with an
//! odd golden-ratio constant so the probe sequence never degenerates to a
//! single bit.
//!
//! ## Wire encoding
//!
//! ```text
//! [k: u8][bits: u32 LE][bits/8 bytes of state]
//! ```

use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_128;

/// Fallback second hash for the degenerate `h2 == 0` case.
const H2_FALLBACK: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    k: u8,
    bits: u32,
    buf: Vec<u8>,
}

impl BloomFilter {
    /// Creates a filter with `bits` capacity probed by `k` hash functions.
    ///
    /// `k == 0` falls back to 7 probes; `bits` is raised to at least 8 and
    /// rounded up to a whole number of bytes.
    pub fn new(bits: u32, k: u8) -> Self {
        let k = if k == 0 { 7 } else { k };
        let bits = bits.clamp(8, u32::MAX - 7);
        let byte_len = (bits + 7) / 8;
        Self {
            k,
            bits: byte_len * 8,
            buf: vec![0u8; byte_len as usize],
        }
    }

    /// Sizes a filter for `nkeys` expected keys at `bits_per_key` density
    /// (0 falls back to 10, roughly a 1% false-positive rate at `k == 7`).
    pub fn for_keys(nkeys: usize, bits_per_key: u32, k: u8) -> Self {
        let nkeys = nkeys.max(1).min(u32::MAX as usize) as u32;
        let bits_per_key = if bits_per_key == 0 { 10 } else { bits_per_key };
        Self::new(nkeys.saturating_mul(bits_per_key), k)
    }

    /// Inserts `key` into the set.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash2(key);
        for i in 0..self.k {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bits as u64) as u32;
            self.buf[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns false only if `key` was definitely never added.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash2(key);
        for i in 0..self.k {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bits as u64) as u32;
            if self.buf[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serializes the filter for embedding in an SSTable.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.buf.len());
        out.push(self.k);
        let mut bits = [0u8; 4];
        LittleEndian::write_u32(&mut bits, self.bits);
        out.extend_from_slice(&bits);
        out.extend_from_slice(&self.buf);
        out
    }

    /// Rebuilds a filter from its encoded bytes.
    ///
    /// Returns `None` when the header is short, `k` or `bits` is zero, or the
    /// state length disagrees with `bits`.
    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < 1 + 4 {
            return None;
        }
        let k = b[0];
        let bits = LittleEndian::read_u32(&b[1..5]);
        let buf = &b[5..];
        if k == 0 || bits == 0 || buf.len() as u64 * 8 != bits as u64 {
            return None;
        }
        Some(Self {
            k,
            bits,
            buf: buf.to_vec(),
        })
    }

    /// Number of hash probes per key.
    pub fn k(&self) -> u8 {
        self.k
    }

    /// Bit capacity (always a multiple of 8).
    pub fn bits(&self) -> u32 {
        self.bits
    }
}

fn hash2(key: &[u8]) -> (u64, u64) {
    let digest = xxh3_128(key);
    let h1 = digest as u64;
    let mut h2 = (digest >> 64) as u64;
    if h2 == 0 {
        h2 = H2_FALLBACK;
    }
    (h1, h2)
}
