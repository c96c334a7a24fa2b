//!
//! Bounded cache of open file handles for one file family
//!
//! The keychain owns two of these: one for the `_hashmap.NNNNN` record
//! files and one for the `_bloom.NNNNN` filter images. Handles are opened
//! read+write on first use and recycled least-recently-used; an evicted
//! handle is flushed before it is dropped. Callers only ever see a
//! short-lived `&mut File` borrow, so every seek/read/write happens while
//! the cache still owns the stream.

use std::fs;
use std::io;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

pub struct StreamCache {
    base:   PathBuf,
    prefix: &'static str,
    cache:  LruCache<u16, fs::File>,
}

impl StreamCache {
    pub fn new(base: &Path, prefix: &'static str, capacity: usize) -> StreamCache {
        assert!(capacity > 0);

        StreamCache {
            base:   PathBuf::from(base),
            prefix: prefix,
            cache:  LruCache::new(NonZeroUsize::new(capacity).unwrap()),
        }
    }

    /// Path of file number `file`, e.g. `<base>/_hashmap.00007`.
    pub fn filename(&self, file: u16) -> PathBuf {
        self.base.join(format!("{}{:05}", self.prefix, file))
    }

    /// Borrow the stream for `file`, opening it if it is not cached.
    ///
    /// The file must already exist; creation is the caller's move.
    pub fn stream(&mut self, file: u16) -> io::Result<&mut fs::File> {
        if !self.cache.contains(&file) {
            let stream = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.filename(file))?;
            self.insert(file, stream);
        }

        Ok(self.cache.get_mut(&file).unwrap())
    }

    /// Hand a freshly created stream to the cache, evicting the
    /// least-recently-used entry if the cache is full.
    pub fn insert(&mut self, file: u16, stream: fs::File) {
        if let Some((_, mut evicted)) = self.cache.push(file, stream) {
            let _ = evicted.flush();
        }
    }
}
