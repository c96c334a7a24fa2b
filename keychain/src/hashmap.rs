//!
//! Disk-backed binary hash map keychain
//!
//! Keys are assigned a bucket by hash; each bucket owns a short linear
//! probe window of slots at a fixed offset in every `_hashmap.NNNNN`
//! file. The files form an append-only chain: when every window slot is
//! taken in every file, a new zeroed file is layered on top. Per file, a
//! bloom filter over the uncompressed keys and an exact occupancy bitmap
//! are held in memory and persisted into `_bloom.NNNNN` images on
//! [`flush`](BinaryHashMap::flush).
//!
//! Lookups walk the chain newest file first so the most recent record for
//! a key wins; free-slot allocation walks oldest first to keep old files
//! densely packed. A record that is torn by power loss mid-write has
//! undefined contents; the keychain is an index without checksums or
//! journaling, and callers re-validate hits against the sector payload.

use std::cmp;
use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use slog::Logger;
use xxhash_rust::xxh64::xxh64;

use bloom::BloomFilter;
use occupancy::OccupancyMap;
use sector_key::{compress_key, SectorKey, KEY_HEADER_LEN, STATE_EMPTY};
use streams::StreamCache;

/// Longest run of consecutive buckets probed for one key.
pub const MAX_LINEAR_PROBE: u32 = 16;

const HASHMAP_PREFIX: &'static str = "_hashmap.";
const BLOOM_PREFIX: &'static str = "_bloom.";

bitflags! {
    pub struct KeychainFlags: u8 {
        /// Never rewrite a matching record in place; every put claims a
        /// fresh slot and lookups prefer the newest file.
        const APPEND = 0b0000_0001;
    }
}

/// Any `KeychainError` leaves the in-memory filters untouched for the
/// failing slot, so the operation can simply be retried.
#[derive(Debug)]
pub enum KeychainError {
    Io(io::Error),
}

impl From<io::Error> for KeychainError {
    fn from(err: io::Error) -> KeychainError {
        KeychainError::Io(err)
    }
}

#[derive(Clone)]
pub struct KeychainConfig {
    pub base_path:     PathBuf,
    pub flags:         KeychainFlags,
    pub total_buckets: u32,
    pub max_key_size:  usize,
    pub lru_capacity:  usize,
}

impl KeychainConfig {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> KeychainConfig {
        KeychainConfig {
            base_path:     base_path.into(),
            flags:         KeychainFlags::APPEND,
            total_buckets: 1 << 20,
            max_key_size:  32,
            lru_capacity:  8,
        }
    }
}

// Mutable half of the keychain, shielded by the coarse mutex: one
// (bloom, occupancy) pair per hashmap file plus both handle caches.
struct State {
    hashmaps:        Vec<(BloomFilter, OccupancyMap)>,
    hashmap_streams: StreamCache,
    bloom_streams:   StreamCache,
}

/// Handle to a keychain on disk.
///
/// All operations are serialized by a single internal mutex and may be
/// called from any thread. Every disk failure is surfaced to the caller;
/// nothing is retried internally.
pub struct BinaryHashMap {
    config:         KeychainConfig,
    key_allocation: usize,
    logger:         Logger,
    state:          Mutex<State>,
}

impl BinaryHashMap {
    /// Opens a keychain at the configured base path, creating the
    /// directory, the first hashmap file and the first filter pair if
    /// they do not exist yet.
    pub fn new(config: KeychainConfig, logger: Logger) -> Result<BinaryHashMap, KeychainError> {
        let key_allocation = KEY_HEADER_LEN + config.max_key_size;

        let mut state = State {
            hashmaps:        Vec::new(),
            hashmap_streams: StreamCache::new(&config.base_path, HASHMAP_PREFIX, config.lru_capacity),
            bloom_streams:   StreamCache::new(&config.base_path, BLOOM_PREFIX, config.lru_capacity),
        };

        initialize(&mut state, &config, key_allocation, &logger)?;

        Ok(BinaryHashMap {
            config:         config,
            key_allocation: key_allocation,
            logger:         logger,
            state:          Mutex::new(state),
        })
    }

    /// Bucket assignment for a key; stable across restarts.
    pub fn bucket(&self, key: &[u8]) -> u32 {
        ((xxh64(key, 0) / 7) % self.config.total_buckets as u64) as u32
    }

    /// Number of hashmap files currently in the chain.
    pub fn hashmap_files(&self) -> usize {
        self.state.lock().unwrap().hashmaps.len()
    }

    /// Look up the most recent record for `key`.
    ///
    /// Files are scanned newest first, skipping any whose bloom filter
    /// rules the key out; within a file the earliest window slot wins.
    pub fn get(&self, key: &[u8]) -> Result<Option<SectorKey>, KeychainError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let bucket = self.bucket(key);
        let file_pos = bucket as u64 * self.key_allocation as u64;

        let mut compressed = key.to_vec();
        compress_key(&mut compressed, self.config.max_key_size);

        let window = self.window_len(bucket);
        let mut buffer = vec![0u8; window * self.key_allocation];

        for file in (0..state.hashmaps.len()).rev() {
            if !state.hashmaps[file].0.maybe_contains(key) {
                continue;
            }

            {
                let stream = state.hashmap_streams.stream(file as u16)?;
                stream.seek(SeekFrom::Start(file_pos))?;
                stream.read_exact(&mut buffer)?;
            }

            for slot in 0..window {
                if !state.hashmaps[file].1.has(bucket as u64 + slot as u64) {
                    continue;
                }

                let offset = slot * self.key_allocation;
                let record = &buffer[offset..offset + self.key_allocation];

                if record[KEY_HEADER_LEN..KEY_HEADER_LEN + compressed.len()] != compressed[..] {
                    continue;
                }

                let mut found = SectorKey::decode(record);
                if !found.ready() {
                    continue;
                }

                debug!(self.logger, "key found";
                       "file" => file, "bucket" => bucket, "slot" => slot,
                       "sector_file" => found.sector_file,
                       "sector_start" => found.sector_start,
                       "sector_size" => found.sector_size);

                // hand the caller's uncompressed key back
                found.key = key.to_vec();
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    /// Store `record` under its key.
    ///
    /// Without `APPEND` a matching or emptied slot found by a newest-first
    /// scan is rewritten in place. Otherwise (or when that scan finds
    /// nothing) the first free window slot in the *oldest* file takes the
    /// record, and a new hashmap file is started once every window is
    /// full. Bloom and occupancy are only updated after the record hit
    /// the disk, so a failed write is safe to retry.
    pub fn put(&self, record: &SectorKey) -> Result<(), KeychainError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let bucket = self.bucket(&record.key);
        let file_pos = bucket as u64 * self.key_allocation as u64;

        let mut compressed = record.key.clone();
        compress_key(&mut compressed, self.config.max_key_size);

        let encoded = record.encode(self.config.max_key_size);
        let window = self.window_len(bucket);

        // update path: rewrite the newest matching or emptied slot
        if !self.config.flags.contains(KeychainFlags::APPEND) {
            let mut buffer = vec![0u8; window * self.key_allocation];

            for file in (0..state.hashmaps.len()).rev() {
                if !state.hashmaps[file].0.maybe_contains(&record.key) {
                    continue;
                }

                {
                    let stream = state.hashmap_streams.stream(file as u16)?;
                    stream.seek(SeekFrom::Start(file_pos))?;
                    stream.read_exact(&mut buffer)?;
                }

                for slot in 0..window {
                    if !state.hashmaps[file].1.has(bucket as u64 + slot as u64) {
                        continue;
                    }

                    let offset = slot * self.key_allocation;
                    let stored = &buffer[offset..offset + self.key_allocation];

                    if stored[0] == STATE_EMPTY
                        || stored[KEY_HEADER_LEN..KEY_HEADER_LEN + compressed.len()] == compressed[..]
                    {
                        write_key(&mut state.hashmap_streams, file as u16,
                                  file_pos + offset as u64, &encoded)?;

                        debug!(self.logger, "key updated";
                               "file" => file, "bucket" => bucket, "slot" => slot);
                        return Ok(());
                    }
                }
            }
        }

        // append path: claim the first free slot, oldest file first
        for file in 0..state.hashmaps.len() {
            for slot in 0..window {
                if state.hashmaps[file].1.has(bucket as u64 + slot as u64) {
                    continue;
                }

                let offset = slot * self.key_allocation;
                write_key(&mut state.hashmap_streams, file as u16,
                          file_pos + offset as u64, &encoded)?;

                state.hashmaps[file].0.insert(&record.key);
                state.hashmaps[file].1.insert(bucket as u64 + slot as u64);

                debug!(self.logger, "key written";
                       "file" => file, "bucket" => bucket, "slot" => slot,
                       "sector_file" => record.sector_file,
                       "sector_start" => record.sector_start,
                       "sector_size" => record.sector_size);
                return Ok(());
            }
        }

        // every window is full: layer a new hashmap file on the chain
        let file = state.hashmaps.len() as u16;
        self.create_hashmap_file(state, file)?;

        write_key(&mut state.hashmap_streams, file, file_pos, &encoded)?;

        let pair = state.hashmaps.last_mut().unwrap();
        pair.0.insert(&record.key);
        pair.1.insert(bucket as u64);

        debug!(self.logger, "key written";
               "file" => file, "bucket" => bucket, "slot" => 0usize);
        Ok(())
    }

    /// Erase the most recent record for `key`, zero-filling its slot.
    ///
    /// Bloom bits are left set, so later lookups still pay a bucket read
    /// for this file until it retires; that read resolves as a normal
    /// false positive. Returns false if no record matched.
    pub fn erase(&self, key: &[u8]) -> Result<bool, KeychainError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let bucket = self.bucket(key);
        let file_pos = bucket as u64 * self.key_allocation as u64;

        let mut compressed = key.to_vec();
        compress_key(&mut compressed, self.config.max_key_size);

        let window = self.window_len(bucket);
        let mut buffer = vec![0u8; window * self.key_allocation];

        for file in (0..state.hashmaps.len()).rev() {
            if !state.hashmaps[file].0.maybe_contains(key) {
                continue;
            }

            {
                let stream = state.hashmap_streams.stream(file as u16)?;
                stream.seek(SeekFrom::Start(file_pos))?;
                stream.read_exact(&mut buffer)?;
            }

            for slot in 0..window {
                if !state.hashmaps[file].1.has(bucket as u64 + slot as u64) {
                    continue;
                }

                let offset = slot * self.key_allocation;
                let stored = &buffer[offset..offset + self.key_allocation];

                if stored[KEY_HEADER_LEN..KEY_HEADER_LEN + compressed.len()] != compressed[..] {
                    continue;
                }

                // clear occupancy first: even if the zero-fill fails
                // half-way, the slot already reads as absent
                state.hashmaps[file].1.erase(bucket as u64 + slot as u64);

                let zeroes = vec![0u8; self.key_allocation];
                write_key(&mut state.hashmap_streams, file as u16,
                          file_pos + offset as u64, &zeroes)?;

                debug!(self.logger, "key erased";
                       "file" => file, "bucket" => bucket, "slot" => slot);
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Write the dirty register ranges of every modified bloom filter and
    /// occupancy map back into their `_bloom.NNNNN` images.
    ///
    /// Hashmap records are written through on every put/erase, so this is
    /// the only buffered state the keychain holds.
    pub fn flush(&self) -> Result<(), KeychainError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        for file in 0..state.hashmaps.len() {
            let (ref mut bloom, ref mut occupancy) = state.hashmaps[file];
            if !bloom.modified() && !occupancy.modified() {
                continue;
            }

            let stream = state.bloom_streams.stream(file as u16)?;

            if bloom.modified() {
                stream.seek(SeekFrom::Start(bloom.modified_offset()))?;
                stream.write_all(&bloom.modified_bytes())?;
            }
            if occupancy.modified() {
                stream.seek(SeekFrom::Start(bloom.size() as u64 + occupancy.modified_offset()))?;
                stream.write_all(&occupancy.modified_bytes())?;
            }
            stream.flush()?;

            bloom.reset_modified();
            occupancy.reset_modified();
        }

        debug!(self.logger, "updated bloom filter disk images");
        Ok(())
    }

    // Slots probed for `bucket`, clipped at the end of the file.
    fn window_len(&self, bucket: u32) -> usize {
        cmp::min(MAX_LINEAR_PROBE, self.config.total_buckets - bucket) as usize
    }

    // Allocate hashmap file `file` as a zeroed sparse file and its
    // companion filter pair in memory and on disk.
    fn create_hashmap_file(&self, state: &mut State, file: u16) -> Result<(), KeychainError> {
        let name = state.hashmap_streams.filename(file);
        let stream = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&name)?;
        stream.set_len(self.config.total_buckets as u64 * self.key_allocation as u64)?;
        state.hashmap_streams.insert(file, stream);

        let pair = (
            BloomFilter::new(self.config.total_buckets as u64),
            OccupancyMap::new(self.config.total_buckets as u64),
        );

        let name = state.bloom_streams.filename(file);
        let mut stream = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&name)?;
        stream.write_all(&pair.0.bytes())?;
        stream.write_all(&pair.1.bytes())?;
        state.bloom_streams.insert(file, stream);

        state.hashmaps.push(pair);

        info!(self.logger, "generated disk hash map"; "file" => file,
              "bytes" => self.config.total_buckets as u64 * self.key_allocation as u64);
        Ok(())
    }
}

// Write one slot image at `pos` in hashmap file `file`.
fn write_key(streams: &mut StreamCache, file: u16, pos: u64, data: &[u8]) -> Result<(), KeychainError> {
    let stream = streams.stream(file)?;
    stream.seek(SeekFrom::Start(pos))?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

// Restore the filter chain from disk, or create the first generation of
// files for a fresh store.
fn initialize(state: &mut State, config: &KeychainConfig, key_allocation: usize, logger: &Logger)
    -> Result<(), KeychainError>
{
    fs::create_dir_all(&config.base_path)?;

    let first_bloom = state.bloom_streams.filename(0);
    if !first_bloom.exists() {
        let pair = (
            BloomFilter::new(config.total_buckets as u64),
            OccupancyMap::new(config.total_buckets as u64),
        );

        let mut stream = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&first_bloom)?;
        stream.write_all(&pair.0.bytes())?;
        stream.write_all(&pair.1.bytes())?;

        info!(logger, "generated bloom filter"; "file" => 0,
              "bytes" => pair.0.size() + pair.1.size());

        state.hashmaps.push(pair);
        state.bloom_streams.insert(0, stream);
    } else {
        // load filter images until the chain runs out
        let mut file = 0u16;
        loop {
            let name = state.bloom_streams.filename(file);
            let mut stream = match fs::OpenOptions::new().read(true).write(true).open(&name) {
                Ok(stream) => stream,
                Err(_) => break,
            };

            let mut bloom = BloomFilter::new(config.total_buckets as u64);
            let mut occupancy = OccupancyMap::new(config.total_buckets as u64);

            let mut image = vec![0u8; bloom.size()];
            stream.seek(SeekFrom::Start(0))?;
            stream.read_exact(&mut image)?;
            bloom.load_bytes(&image);

            let mut image = vec![0u8; occupancy.size()];
            stream.read_exact(&mut image)?;
            occupancy.load_bytes(&image);

            state.hashmaps.push((bloom, occupancy));
            state.bloom_streams.insert(file, stream);
            file += 1;
        }

        info!(logger, "loaded disk indexes"; "hashmaps" => state.hashmaps.len());
    }

    let first_hashmap = state.hashmap_streams.filename(0);
    if !first_hashmap.exists() {
        let stream = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&first_hashmap)?;
        stream.set_len(config.total_buckets as u64 * key_allocation as u64)?;

        info!(logger, "generated disk hash map"; "file" => 0,
              "bytes" => config.total_buckets as u64 * key_allocation as u64);

        state.hashmap_streams.insert(0, stream);
    } else {
        let stream = fs::OpenOptions::new().read(true).write(true).open(&first_hashmap)?;
        state.hashmap_streams.insert(0, stream);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate tempdir;

    use slog;
    use super::*;

    fn test_map(dir: &::std::path::Path, buckets: u32) -> BinaryHashMap {
        let mut config = KeychainConfig::new(dir);
        config.total_buckets = buckets;
        BinaryHashMap::new(config, slog::Logger::root(slog::Discard, o!())).unwrap()
    }

    #[test]
    fn test_bucket_in_range() {
        let dir = tempdir::TempDir::new("keychain").unwrap();
        let map = test_map(dir.path(), 16);

        for n in 0..1000u32 {
            assert!(map.bucket(&n.to_le_bytes()) < 16);
        }
    }

    #[test]
    fn test_initialize_creates_files() {
        let dir = tempdir::TempDir::new("keychain").unwrap();
        let map = test_map(dir.path(), 16);

        assert_eq!(map.hashmap_files(), 1);
        assert!(dir.path().join("_hashmap.00000").exists());
        assert!(dir.path().join("_bloom.00000").exists());

        // 45 bytes per slot, 16 buckets
        let meta = ::std::fs::metadata(dir.path().join("_hashmap.00000")).unwrap();
        assert_eq!(meta.len(), 16 * 45);
    }

    #[test]
    fn test_reopen_restores_filters() {
        let dir = tempdir::TempDir::new("keychain").unwrap();

        {
            let map = test_map(dir.path(), 16);
            map.put(&SectorKey::new(vec![1, 2, 3], 4, 5, 6)).unwrap();
            map.flush().unwrap();
        }

        let map = test_map(dir.path(), 16);
        let found = map.get(&[1, 2, 3]).unwrap().unwrap();
        assert_eq!(found.sector_file, 4);
        assert_eq!(found.sector_start, 5);
        assert_eq!(found.sector_size, 6);
    }

    #[test]
    fn test_update_in_place_without_append() {
        let dir = tempdir::TempDir::new("keychain").unwrap();
        let mut config = KeychainConfig::new(dir.path());
        config.total_buckets = 16;
        config.flags = KeychainFlags::empty();
        let map = BinaryHashMap::new(config, slog::Logger::root(slog::Discard, o!())).unwrap();

        map.put(&SectorKey::new(vec![9], 1, 1, 1)).unwrap();
        map.put(&SectorKey::new(vec![9], 2, 2, 2)).unwrap();

        let found = map.get(&[9]).unwrap().unwrap();
        assert_eq!(found.sector_file, 2);

        // in-place update claims no second slot
        assert_eq!(map.hashmap_files(), 1);
    }
}
