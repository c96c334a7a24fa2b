//!
//! Peer networking core: connection pools with readiness polling
//!
//! The crate provides the pieces a node's network layer is assembled
//! from: a transport [`Connection`] with non-blocking buffers, the
//! [`Protocol`] trait concrete wire protocols implement, per-peer
//! [`DdosFilter`] scoring, and the [`DataThread`] worker that owns a pool
//! of connections and drives them off a single `poll(2)` loop.
//!
//! Listeners and concrete protocols live in higher layers; they hand
//! accepted sockets to a data thread and receive lifecycle events plus
//! completed message payloads back through their protocol object.

extern crate libc;
#[macro_use]
extern crate slog;

mod ddos;
mod connection;
mod data_thread;

pub use ddos::{DdosFilter, DdosScore};
pub use connection::{Connection, DisconnectReason, Event, NetError, Protocol, INVALID_SOCKET};
pub use data_thread::{DataThread, DataThreadConfig};
