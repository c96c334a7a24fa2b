//!
//! Application context for the node's low-level cores
//!
//! The two heavy subsystems live in their own crates: `keychain` (the
//! disk index) and `meridian-net` (the connection pool workers). This
//! crate wires them into a process: one [`Node`] owns the root logger,
//! the keychain handle and the shared shutdown flag, replacing the
//! process-wide singletons a node daemon would otherwise accumulate.
//!
//! Teardown runs in reverse dependency order: callers drop their data
//! threads first (each disconnects its pool), then flush the keychain.

extern crate libc;
extern crate zeroize;
#[macro_use]
pub extern crate slog;
extern crate slog_term;

pub extern crate keychain;
pub extern crate meridian_net as net;

mod config;
mod secure;

pub use config::Config;
pub use secure::SecureBytes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slog::Drain;

use keychain::{BinaryHashMap, KeychainConfig, KeychainError};

/// Handles to everything the node cores share.
pub struct Node {
    pub keychain: BinaryHashMap,

    /// Process-wide stop flag observed by every data thread.
    pub shutdown: Arc<AtomicBool>,

    pub logger: slog::Logger,
}

impl Node {
    /// Build the context: root logger, keychain under `<root>/keychain`,
    /// fresh shutdown flag.
    pub fn new(config: &Config) -> Result<Node, KeychainError> {
        let logger = default_logger();

        let keychain_config = KeychainConfig::new(config.root.join("keychain"));
        let keychain = BinaryHashMap::new(
            keychain_config,
            logger.new(o!("subsystem" => "keychain")),
        )?;

        info!(logger, "node context initialized";
              "dir" => config.root.to_str().unwrap_or("?"));

        Ok(Node {
            keychain: keychain,
            shutdown: Arc::new(AtomicBool::new(false)),
            logger:   logger,
        })
    }

    /// Child logger for a data thread.
    pub fn net_logger(&self, id: u32) -> slog::Logger {
        self.logger.new(o!("subsystem" => "net", "thread" => id))
    }

    /// Ask every worker sharing the flag to stop. Workers observe the
    /// flag within their poll quantum; callers then drop their data
    /// threads and finish with [`flush`](Node::flush).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!(self.logger, "shutdown requested");
    }

    /// Persist the keychain's in-memory filter state.
    pub fn flush(&self) -> Result<(), KeychainError> {
        self.keychain.flush()
    }
}

/// Terminal logger in the node's house format.
pub fn default_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = ::std::sync::Mutex::new(drain).fuse();

    slog::Logger::root(drain, o!())
}
