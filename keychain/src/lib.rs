//!
//! Disk index mapping opaque binary keys to sector locators
//!
//! The keychain is the bottom layer of a sector database: values live in
//! sector payload files owned by a higher layer, and this crate maintains
//! the hash-map-on-disk that finds their locators in O(1) expected time
//! across an append-only chain of hashmap files.
//!
//! Design properties
//!
//! * bucketed linear probing with a bounded window per key
//! * per-file bloom filter + occupancy bitmap held in memory, persisted
//!   with partial (dirty-range) writes on flush
//! * bounded file-descriptor usage through two LRU handle caches
//! * coarse-mutex linearizability; callable from any thread
//!
//! See [BinaryHashMap](struct.BinaryHashMap.html) for the operations.

#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate lru;
#[macro_use]
extern crate slog;
extern crate xxhash_rust;

mod bitarray;
mod bloom;
mod occupancy;
mod sector_key;
mod streams;
mod hashmap;

pub use bitarray::BitArray;
pub use bloom::BloomFilter;
pub use occupancy::OccupancyMap;
pub use sector_key::{compress_key, SectorKey, KEY_HEADER_LEN, STATE_EMPTY, STATE_READY};
pub use hashmap::{BinaryHashMap, KeychainConfig, KeychainError, KeychainFlags, MAX_LINEAR_PROBE};
