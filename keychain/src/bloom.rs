//!
//! Probabilistic key membership per hashmap file
//!
//! One filter is kept in memory per `_hashmap.NNNNN` file and persisted
//! into the paired `_bloom.NNNNN` image. It is keyed by the full
//! *uncompressed* key, so collisions introduced by key compression do not
//! weaken it. A negative answer is authoritative and lets the keychain
//! skip the disk read for that file entirely.

use std::f64::consts::LN_2;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use bitarray::BitArray;

/// Number of hash functions.
const BLOOM_HASHES: u64 = 3;

pub struct BloomFilter {
    bits:   BitArray,
    n_bits: u64,
}

impl BloomFilter {
    /// Create an empty filter dimensioned for `n_buckets` keys.
    ///
    /// The bit capacity is `ceil(n * k / ln 2)`, the optimum for k hashes
    /// at n insertions.
    pub fn new(n_buckets: u64) -> BloomFilter {
        let n_bits = ((n_buckets * BLOOM_HASHES) as f64 / LN_2).ceil() as u64;

        BloomFilter {
            bits:   BitArray::new(n_bits),
            n_bits: n_bits,
        }
    }

    /// Add a key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        for k in 0..BLOOM_HASHES {
            let bit = self.bit(key, k);
            self.bits.set_bit(bit);
        }
    }

    /// Check membership; false positives possible, false negatives not.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        (0..BLOOM_HASHES).all(|k| self.bits.is_set(self.bit(key, k)))
    }

    pub fn size(&self) -> usize {
        self.bits.size()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bits.bytes()
    }

    pub fn load_bytes(&mut self, image: &[u8]) {
        self.bits.load_bytes(image);
    }

    pub fn modified(&self) -> bool {
        self.bits.modified()
    }

    pub fn modified_offset(&self) -> u64 {
        self.bits.modified_offset()
    }

    pub fn modified_bytes(&self) -> Vec<u8> {
        self.bits.modified_bytes()
    }

    pub fn reset_modified(&mut self) {
        self.bits.reset_modified()
    }

    // Bit index for hash number `k`; the seed salts the hash so the three
    // probes are independent.
    fn bit(&self, key: &[u8], k: u64) -> u64 {
        xxh3_64_with_seed(key, k) % self.n_bits
    }
}
