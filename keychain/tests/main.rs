extern crate keychain;
extern crate rand;
#[macro_use]
extern crate slog;
extern crate tempdir;

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use rand::Rng;
use tempdir::TempDir;

use keychain::*;

const KEY_ALLOCATION: usize = KEY_HEADER_LEN + 32;

fn open_map(dir: &Path, buckets: u32) -> BinaryHashMap {
    let mut config = KeychainConfig::new(dir);
    config.total_buckets = buckets;
    BinaryHashMap::new(config, slog::Logger::root(slog::Discard, o!())).unwrap()
}

// Brute-force `count` distinct keys that land in `bucket`; the bucket
// function is stable, so this stands in for a stubbed hash.
fn same_bucket_keys(map: &BinaryHashMap, bucket: u32, count: usize) -> Vec<Vec<u8>> {
    let mut keys = Vec::with_capacity(count);
    let mut n: u64 = 0;
    while keys.len() < count {
        let key = n.to_le_bytes().to_vec();
        if map.bucket(&key) == bucket {
            keys.push(key);
        }
        n += 1;
    }
    keys
}

fn slot_bytes(image: &[u8], bucket: u32, slot: usize) -> &[u8] {
    let offset = (bucket as usize + slot) * KEY_ALLOCATION;
    &image[offset..offset + KEY_ALLOCATION]
}

#[test]
fn test_single_key_round_trip() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    let record = SectorKey::new(vec![0x01], 5, 100, 42);
    map.put(&record).unwrap();

    let found = map.get(&[0x01]).unwrap().unwrap();
    assert_eq!(found, record);
    assert_eq!(found.state, STATE_READY);
}

#[test]
fn test_get_missing_key() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    assert!(map.get(&[0xEE, 0xFF]).unwrap().is_none());
    assert!(!map.erase(&[0xEE, 0xFF]).unwrap());
}

#[test]
fn test_linear_probing_spills_into_new_file() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 64);

    // 17 colliders on bucket 5 against a window of 16
    let keys = same_bucket_keys(&map, 5, 17);
    for (n, key) in keys.iter().enumerate() {
        map.put(&SectorKey::new(key.clone(), n as u16, n as u32, 1)).unwrap();
    }

    assert_eq!(map.hashmap_files(), 2);

    // the first sixteen fill file 0 slots 0..16 in put order
    let image = fs::read(dir.path().join("_hashmap.00000")).unwrap();
    for slot in 0..16 {
        let record = SectorKey::decode(slot_bytes(&image, 5, slot));
        assert_eq!(record.state, STATE_READY);
        assert_eq!(record.sector_file, slot as u16);
        assert_eq!(record.key, keys[slot]);
    }

    // the seventeenth lands at file 1, slot 0
    let image = fs::read(dir.path().join("_hashmap.00001")).unwrap();
    let record = SectorKey::decode(slot_bytes(&image, 5, 0));
    assert_eq!(record.state, STATE_READY);
    assert_eq!(record.key, keys[16]);

    let found = map.get(&keys[16]).unwrap().unwrap();
    assert_eq!(found.sector_file, 16);

    // every record stayed inside the probe window of bucket 5
    for name in &["_hashmap.00000", "_hashmap.00001"] {
        let image = fs::read(dir.path().join(name)).unwrap();
        for bucket in 0..64usize {
            let state = image[bucket * KEY_ALLOCATION];
            if state != STATE_EMPTY {
                assert!(bucket >= 5 && bucket < 5 + MAX_LINEAR_PROBE as usize);
            }
        }
    }
}

#[test]
fn test_long_key_compression() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    let key = vec![0xAB; 40];
    let record = SectorKey::new(key.clone(), 7, 700, 77);
    map.put(&record).unwrap();

    // lookups use the original key and hand it back uncompressed
    let found = map.get(&key).unwrap().unwrap();
    assert_eq!(found, record);
    assert_eq!(found.key.len(), 40);

    // on disk the slot holds the XOR-fold of the key
    let mut folded = key.clone();
    compress_key(&mut folded, 32);
    assert_eq!(folded.len(), 32);

    let bucket = map.bucket(&key);
    let image = fs::read(dir.path().join("_hashmap.00000")).unwrap();
    let stored = slot_bytes(&image, bucket, 0);
    assert_eq!(&stored[KEY_HEADER_LEN..KEY_HEADER_LEN + 32], &folded[..]);
}

#[test]
fn test_erase_frees_slot_for_reuse() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    let keys = same_bucket_keys(&map, 3, 3);
    let (k1, k2, k3) = (&keys[0], &keys[1], &keys[2]);

    map.put(&SectorKey::new(k1.clone(), 1, 1, 1)).unwrap();
    map.put(&SectorKey::new(k2.clone(), 2, 2, 2)).unwrap();

    assert!(map.erase(k1).unwrap());
    assert!(map.get(k1).unwrap().is_none());

    // the erased slot is zero-filled on disk
    let image = fs::read(dir.path().join("_hashmap.00000")).unwrap();
    assert!(slot_bytes(&image, 3, 0).iter().all(|&b| b == 0));

    // the next put reclaims the vacated slot 0
    map.put(&SectorKey::new(k3.clone(), 3, 3, 3)).unwrap();
    let image = fs::read(dir.path().join("_hashmap.00000")).unwrap();
    let record = SectorKey::decode(slot_bytes(&image, 3, 0));
    assert_eq!(record.key, *k3);

    // the neighbour was untouched
    assert_eq!(map.get(k2).unwrap().unwrap().sector_file, 2);
    assert_eq!(map.hashmap_files(), 1);
}

#[test]
fn test_erase_then_reput() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 64);

    let key = vec![0x42; 10];
    map.put(&SectorKey::new(key.clone(), 1, 10, 100)).unwrap();
    assert!(map.erase(&key).unwrap());
    assert!(map.get(&key).unwrap().is_none());

    map.put(&SectorKey::new(key.clone(), 2, 20, 200)).unwrap();
    let found = map.get(&key).unwrap().unwrap();
    assert_eq!(found.sector_file, 2);
    assert_eq!(found.sector_start, 20);
}

#[test]
fn test_newest_file_wins() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    let keys = same_bucket_keys(&map, 0, 16);
    let target = &keys[0];

    // first version of the target, then fill the rest of the window
    map.put(&SectorKey::new(target.clone(), 1, 1, 1)).unwrap();
    for key in &keys[1..] {
        map.put(&SectorKey::new(key.clone(), 9, 9, 9)).unwrap();
    }

    // the window of file 0 is full, so the update spills into file 1
    map.put(&SectorKey::new(target.clone(), 2, 2, 2)).unwrap();
    assert_eq!(map.hashmap_files(), 2);

    // newest file is scanned first
    let found = map.get(target).unwrap().unwrap();
    assert_eq!(found.sector_file, 2);
}

#[test]
fn test_no_false_negatives_random_batch() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 4096);

    let mut rng = rand::thread_rng();
    let mut keys = Vec::new();

    for n in 0..500u32 {
        let len = rng.gen_range(1..48);
        let mut key = vec![0u8; len];
        rng.fill(&mut key[..]);
        key.extend_from_slice(&n.to_le_bytes());

        map.put(&SectorKey::new(key.clone(), (n % 100) as u16, n, n + 1)).unwrap();
        keys.push((key, n));
    }

    for &(ref key, n) in &keys {
        let found = map.get(key).unwrap()
            .unwrap_or_else(|| panic!("key {} lost", n));
        assert_eq!(found.state, STATE_READY);
        assert_eq!(found.sector_start, n);
    }
}

#[test]
fn test_bloom_negative_skips_disk_read() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    let key = vec![0x55; 8];
    map.put(&SectorKey::new(key.clone(), 1, 1, 1)).unwrap();

    // truncate the hashmap file behind the keychain's back: any lookup
    // that actually reads the bucket window now fails
    fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(dir.path().join("_hashmap.00000"))
        .unwrap();

    // the inserted key is bloom-positive, so its lookup must hit disk
    assert!(map.get(&key).is_err());

    // keys the filter rules out never touch the file; tolerate the odd
    // bloom false positive among the probes
    let skipped = (0u32..20)
        .filter(|n| match map.get(&[0xF0, *n as u8, 0x0F]) {
            Ok(None) => true,
            _        => false,
        })
        .count();
    assert!(skipped >= 19, "only {} lookups skipped the disk", skipped);
}

#[test]
fn test_corrupt_state_reads_as_absent() {
    let dir = TempDir::new("keychain").unwrap();
    let map = open_map(dir.path(), 16);

    let key = vec![7; 4];
    map.put(&SectorKey::new(key.clone(), 1, 1, 1)).unwrap();

    // zero the state byte of the slot on disk
    let bucket = map.bucket(&key);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("_hashmap.00000"))
        .unwrap();
    file.seek(SeekFrom::Start(bucket as u64 * KEY_ALLOCATION as u64)).unwrap();
    file.write_all(&[0]).unwrap();

    // the record no longer reads as ready, so the key is simply absent
    assert!(map.get(&key).unwrap().is_none());
}

#[test]
fn test_flush_persists_across_reopen() {
    let dir = TempDir::new("keychain").unwrap();

    let mut expected = Vec::new();
    {
        let map = open_map(dir.path(), 256);
        let mut rng = rand::thread_rng();
        for n in 0..64u32 {
            let mut key = vec![0u8; 16];
            rng.fill(&mut key[..]);
            map.put(&SectorKey::new(key.clone(), 0, n, 1)).unwrap();
            expected.push((key, n));
        }
        map.flush().unwrap();
    }

    // a fresh handle replays the persisted filter images
    let map = open_map(dir.path(), 256);
    for &(ref key, n) in &expected {
        assert_eq!(map.get(key).unwrap().unwrap().sector_start, n);
    }

    // erases are visible after a second flush/reopen cycle
    map.erase(&expected[0].0).unwrap();
    map.flush().unwrap();

    let map = open_map(dir.path(), 256);
    assert!(map.get(&expected[0].0).unwrap().is_none());
    assert_eq!(map.get(&expected[1].0).unwrap().unwrap().sector_start, expected[1].1);
}
