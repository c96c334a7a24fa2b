//!
//! Worker thread owning a pool of protocol connections
//!
//! One `DataThread` owns one OS thread and two index-aligned vectors: the
//! connection slots and the `pollfd` array handed to `poll(2)`. A slot is
//! either `Empty` or holds a live protocol object; empty slots carry
//! `INVALID_SOCKET` in their poll descriptor and are reused lowest-index
//! first.
//!
//! External threads only touch the slot table under its mutex (install
//! into an empty slot, or tear everything down); the worker does all
//! per-connection reading, writing and event delivery. An idle worker
//! parks on a condition variable until the first connection arrives, and
//! the poll timeout bounds how long shutdown can go unnoticed.
//!
//! Failure isolation: every error a protocol raises is logged and turned
//! into a disconnect of that one connection. Exactly one disconnect event
//! is delivered per connection, whatever the reason.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use libc;
use slog::Logger;

use connection::{DisconnectReason, Event, NetError, Protocol, INVALID_SOCKET};
use ddos::DdosFilter;

/// Upper bound on one readiness wait, and so on shutdown latency.
const POLL_TIMEOUT_MS: i32 = 100;

/// Breather between sweeps so a busy pool cannot spin the core.
const SPIN_SLEEP_MS: u64 = 1;

#[derive(Clone)]
pub struct DataThreadConfig {
    pub id:               u32,
    pub ddos_enabled:     bool,
    pub rscore_limit:     u64,
    pub cscore_limit:     u64,
    pub timeout_secs:     u64,
    pub metering_enabled: bool,
}

enum Slot<P> {
    Empty,
    Live(P),
}

impl<P> Slot<P> {
    fn is_empty(&self) -> bool {
        match *self {
            Slot::Empty   => true,
            Slot::Live(_) => false,
        }
    }
}

// The two aligned vectors; always equal length.
struct SlotTable<P> {
    connections: Vec<Slot<P>>,
    pollfds:     Vec<libc::pollfd>,
}

struct Shared<P: Protocol> {
    table:            Mutex<SlotTable<P>>,
    connection_count: AtomicU32,
    request_count:    AtomicU64,
    stop:             AtomicBool,
    shutdown:         Arc<AtomicBool>,

    // park mutex exists only to carry the condvar; the slot table has
    // its own lock
    park:      Mutex<()>,
    condition: Condvar,

    config: DataThreadConfig,
    logger: Logger,
}

impl<P: Protocol> Shared<P> {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst)
    }
}

/// A pool of connections driven by a single worker thread.
///
/// Dropping the thread stops the worker, joins it, and disconnects every
/// remaining connection with a `Shutdown` reason.
pub struct DataThread<P: Protocol> {
    shared: Arc<Shared<P>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<P: Protocol> DataThread<P> {
    /// Start the worker. `shutdown` is the process-wide stop flag shared
    /// by every thread in the node.
    pub fn new(config: DataThreadConfig, shutdown: Arc<AtomicBool>, logger: Logger) -> DataThread<P> {
        let name = format!("data-thread-{}", config.id);

        let shared = Arc::new(Shared {
            table: Mutex::new(SlotTable {
                connections: Vec::new(),
                pollfds:     Vec::new(),
            }),
            connection_count: AtomicU32::new(0),
            request_count:    AtomicU64::new(0),
            stop:             AtomicBool::new(false),
            shutdown:         shutdown,
            park:             Mutex::new(()),
            condition:        Condvar::new(),
            config:           config,
            logger:           logger,
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || worker(shared))
                .expect("failed to spawn data thread")
        };

        DataThread {
            shared: shared,
            worker: Some(worker),
        }
    }

    /// Install an accepted socket into the lowest free slot.
    pub fn add_connection(&self, socket: TcpStream, ddos: Option<DdosFilter>) {
        let mut node = P::inbound(socket, ddos, self.shared.config.ddos_enabled);
        node.event(Event::Connect);
        node.connection_mut().set_connected(true);

        self.install(node);
    }

    /// Dial a peer and install the connection; false if the dial failed,
    /// leaving the slot table untouched.
    pub fn add_outbound(&self, address: &str, port: u16, ddos: Option<DdosFilter>) -> bool {
        let mut node = P::outbound(ddos, self.shared.config.ddos_enabled);

        if !node.connection_mut().connect(address, port) {
            return false;
        }

        node.connection_mut().set_outgoing(true);
        node.event(Event::Connect);
        node.connection_mut().set_connected(true);

        self.install(node);
        true
    }

    /// Disconnect every live connection, delivering a `Shutdown` reason.
    pub fn disconnect_all(&self) {
        let mut table = self.shared.table.lock().unwrap();

        for index in 0..table.connections.len() {
            if let Slot::Live(ref mut node) = table.connections[index] {
                node.event(Event::Disconnect(DisconnectReason::Shutdown));
            }
            remove_slot(&mut table, index, &self.shared);
        }
    }

    /// Live connections in the pool.
    pub fn connection_count(&self) -> u32 {
        self.shared.connection_count.load(Ordering::SeqCst)
    }

    /// Completed requests since start, when metering is enabled.
    pub fn request_count(&self) -> u64 {
        self.shared.request_count.load(Ordering::SeqCst)
    }

    fn install(&self, mut node: P) {
        if self.shared.config.ddos_enabled {
            if let Some(ref mut ddos) = node.connection_mut().ddos {
                ddos.c_score.add(1);
            }
        }

        {
            let mut table = self.shared.table.lock().unwrap();

            let slot = find_slot(&table);
            if slot == table.connections.len() {
                table.connections.push(Slot::Empty);
                table.pollfds.push(libc::pollfd {
                    fd:      INVALID_SOCKET,
                    events:  0,
                    revents: 0,
                });
            }

            table.pollfds[slot] = libc::pollfd {
                fd:      node.connection().fd(),
                events:  node.connection().events(),
                revents: 0,
            };
            table.connections[slot] = Slot::Live(node);

            self.shared.connection_count.fetch_add(1, Ordering::SeqCst);
        }

        self.shared.condition.notify_all();
    }
}

impl<P: Protocol> Drop for DataThread<P> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.condition.notify_all();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.disconnect_all();
    }
}

// Lowest empty slot, or the table length if every slot is live.
fn find_slot<P>(table: &SlotTable<P>) -> usize {
    for (index, slot) in table.connections.iter().enumerate() {
        if slot.is_empty() {
            return index;
        }
    }
    table.connections.len()
}

// Clear a slot and wake anyone waiting on the pool shrinking.
fn remove_slot<P: Protocol>(table: &mut SlotTable<P>, index: usize, shared: &Shared<P>) {
    if table.connections[index].is_empty() {
        shared.condition.notify_all();
        return;
    }

    if let Slot::Live(ref mut node) = table.connections[index] {
        node.connection_mut().close();
    }

    table.connections[index] = Slot::Empty;
    table.pollfds[index].fd = INVALID_SOCKET;
    shared.connection_count.fetch_sub(1, Ordering::SeqCst);

    shared.condition.notify_all();
}

// Deliver the disconnect event, then clear the slot.
fn disconnect_remove<P: Protocol>(
    table: &mut SlotTable<P>,
    index: usize,
    reason: DisconnectReason,
    shared: &Shared<P>,
) {
    if let Slot::Live(ref mut node) = table.connections[index] {
        node.event(Event::Disconnect(reason));

        debug!(shared.logger, "connection removed";
               "thread" => shared.config.id,
               "slot" => index,
               "reason" => format!("{:?}", reason));
    }

    remove_slot(table, index, shared);
}

// The worker loop: park while idle, poll, sweep every slot.
fn worker<P: Protocol>(shared: Arc<Shared<P>>) {
    loop {
        if shared.stopping() {
            return;
        }

        thread::sleep(Duration::from_millis(SPIN_SLEEP_MS));

        // park until there is something to watch
        if shared.connection_count.load(Ordering::SeqCst) == 0 {
            let guard = shared.park.lock().unwrap();
            let _guard = shared
                .condition
                .wait_timeout_while(guard, Duration::from_millis(POLL_TIMEOUT_MS as u64), |_| {
                    !shared.stopping() && shared.connection_count.load(Ordering::SeqCst) == 0
                })
                .unwrap();
        }

        if shared.stopping() {
            return;
        }

        // snapshot and poll under the table lock
        let size = {
            let mut table = shared.table.lock().unwrap();
            let table = &mut *table;

            let size = table.connections.len();
            if size == 0 {
                continue;
            }

            let mut any_live = false;
            for pollfd in table.pollfds.iter_mut() {
                pollfd.revents = 0;
                if pollfd.fd != INVALID_SOCKET {
                    any_live = true;
                }
            }
            if !any_live {
                continue;
            }

            let result = unsafe {
                libc::poll(table.pollfds.as_mut_ptr(), size as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if result < 0 {
                debug!(shared.logger, "poll failed";
                       "thread" => shared.config.id,
                       "errno" => ::std::io::Error::last_os_error().to_string());
            }

            size
        };

        // sweep every slot; not gated on poll readiness, so timeouts and
        // bans fire on silent connections too
        for index in 0..size {
            process_slot(&shared, index);
        }
    }
}

// One slot of the sweep; takes and releases the table lock so external
// add/remove calls interleave between slots.
fn process_slot<P: Protocol>(shared: &Arc<Shared<P>>, index: usize) {
    let mut table = shared.table.lock().unwrap();
    let table = &mut *table;

    let revents = table.pollfds[index].revents;

    let reason = {
        let node = match table.connections[index] {
            Slot::Live(ref mut node) => node,
            Slot::Empty              => return,
        };

        if !node.connection().connected() {
            return;
        }

        check_slot(shared, node, revents)
    };

    if let Some(reason) = reason {
        disconnect_remove(table, index, reason, shared);
    }
}

// Decide the fate of one live connection for this sweep.
fn check_slot<P: Protocol>(shared: &Shared<P>, node: &mut P, revents: libc::c_short)
    -> Option<DisconnectReason>
{
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Some(DisconnectReason::Errors);
    }

    if node.connection().errors() {
        return Some(DisconnectReason::Errors);
    }

    if node.connection().timeout(shared.config.timeout_secs) {
        return Some(DisconnectReason::Timeout);
    }

    if shared.config.ddos_enabled {
        if let Some(ref mut ddos) = node.connection_mut().ddos {
            if ddos.r_score.score() > shared.config.rscore_limit
                || ddos.c_score.score() > shared.config.cscore_limit
            {
                ddos.ban();
            }

            if ddos.banned() {
                return Some(DisconnectReason::Ddos);
            }
        }
    }

    node.event(Event::Generic);

    match drive_packet(shared, node) {
        Ok(keep) => {
            if keep {
                None
            } else {
                Some(DisconnectReason::Force)
            }
        }
        Err(NetError::PeerClosed) => Some(DisconnectReason::Peer),
        Err(err) => {
            debug!(shared.logger, "data connection error";
                   "thread" => shared.config.id,
                   "error" => err.to_string());
            Some(DisconnectReason::Errors)
        }
    }
}

// Flush, read, and process at most one completed packet.
fn drive_packet<P: Protocol>(shared: &Shared<P>, node: &mut P) -> Result<bool, NetError> {
    node.connection_mut().flush()?;
    node.read_packet()?;

    if node.packet_complete() {
        if shared.config.metering_enabled {
            shared.request_count.fetch_add(1, Ordering::SeqCst);
        }
        if shared.config.ddos_enabled {
            if let Some(ref mut ddos) = node.connection_mut().ddos {
                ddos.r_score.add(1);
            }
        }

        if !node.process_packet()? {
            return Ok(false);
        }
        node.reset_packet();
    }

    Ok(true)
}
