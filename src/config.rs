//! Node configuration
//!
//! Only the data-directory root lives here; the keychain and data-thread
//! tunables are owned by their crates and wired up by [`Node`](::Node).

use std::fs;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    /// Root of the on-disk store.
    pub root: PathBuf,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(root: P) -> Config {
        Config { root: root.into() }
    }

    /// Creates and empties a scratch store under `tmp/`; used by tests.
    pub fn new_empty<T: Into<String>>(name: T) -> Config {
        let mut path = PathBuf::from("tmp");
        path.push(name.into().replace("/", "-"));

        let _ = fs::remove_dir_all(&path);

        Config { root: path }
    }
}
