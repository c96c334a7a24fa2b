//!
//! Socket plumbing shared by every connection protocol
//!
//! A [`Connection`] owns the non-blocking socket, the receive and write
//! buffers, the activity clock and the optional DDoS filter. Concrete
//! protocols embed one and implement [`Protocol`] on top: the data thread
//! only ever talks to the trait. Protocol operations return results; the
//! worker converts any error into the disconnect path, so a misbehaving
//! peer can never take the thread down.

use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use libc;

use ddos::DdosFilter;

/// Marks an unused slot in the poll descriptor array.
pub const INVALID_SOCKET: RawFd = -1;

const READ_CHUNK: usize = 8192;

/// Why a connection was dropped; carried by the disconnect event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DisconnectReason {
    Timeout,
    Errors,
    Ddos,
    Force,
    Peer,
    Shutdown,
}

/// Lifecycle notifications delivered to the protocol object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    Connect,
    Generic,
    Disconnect(DisconnectReason),
}

#[derive(Debug)]
pub enum NetError {
    Io(io::Error),
    /// The remote side closed the stream.
    PeerClosed,
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> NetError {
        NetError::Io(err)
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            NetError::Io(ref err) => write!(f, "io error: {}", err),
            NetError::PeerClosed  => write!(f, "peer closed connection"),
        }
    }
}

/// Contract between the data thread and a connection protocol.
///
/// Implementors embed a [`Connection`] for the transport and add their
/// own frame decoding and message handling.
pub trait Protocol: Send + 'static {
    /// Wrap a socket accepted by a listener.
    fn inbound(socket: TcpStream, ddos: Option<DdosFilter>, ddos_enabled: bool) -> Self;

    /// Prepare an outbound connection; `Connection::connect` dials it.
    fn outbound(ddos: Option<DdosFilter>, ddos_enabled: bool) -> Self;

    fn connection(&self) -> &Connection;
    fn connection_mut(&mut self) -> &mut Connection;

    /// Pull bytes off the socket and advance frame decoding.
    fn read_packet(&mut self) -> Result<(), NetError>;

    /// A complete message is waiting in the connection's `incoming`.
    fn packet_complete(&self) -> bool;

    /// Handle the completed message; `Ok(false)` requests disconnect.
    fn process_packet(&mut self) -> Result<bool, NetError>;

    /// Clear message state, ready to decode the next frame.
    fn reset_packet(&mut self);

    /// Lifecycle notification from the data thread.
    fn event(&mut self, event: Event);
}

pub struct Connection {
    socket: Option<TcpStream>,

    // unparsed bytes read off the socket
    buffer: Vec<u8>,

    // bytes queued for the peer, drained by flush
    outbound: Vec<u8>,

    /// Payload of the last completed inbound message.
    pub incoming: Vec<u8>,

    /// Per-peer scoring; `None` when DDoS protection is off.
    pub ddos: Option<DdosFilter>,

    last_active: Instant,
    outgoing:    bool,
    connected:   bool,
    errors:      bool,
}

impl Connection {
    /// Wrap an accepted socket; switches it to non-blocking mode.
    pub fn inbound(socket: TcpStream, ddos: Option<DdosFilter>, ddos_enabled: bool) -> Connection {
        let errors = socket.set_nonblocking(true).is_err();

        Connection {
            socket:      Some(socket),
            buffer:      Vec::new(),
            outbound:    Vec::new(),
            incoming:    Vec::new(),
            ddos:        if ddos_enabled { ddos } else { None },
            last_active: Instant::now(),
            outgoing:    false,
            connected:   false,
            errors:      errors,
        }
    }

    /// An unconnected outbound shell; [`connect`](Connection::connect)
    /// attaches the socket.
    pub fn outbound(ddos: Option<DdosFilter>, ddos_enabled: bool) -> Connection {
        Connection {
            socket:      None,
            buffer:      Vec::new(),
            outbound:    Vec::new(),
            incoming:    Vec::new(),
            ddos:        if ddos_enabled { ddos } else { None },
            last_active: Instant::now(),
            outgoing:    true,
            connected:   false,
            errors:      false,
        }
    }

    /// Dial `address:port`; returns false on failure, leaving the
    /// connection unattached.
    pub fn connect(&mut self, address: &str, port: u16) -> bool {
        match TcpStream::connect((address, port)) {
            Ok(socket) => {
                if socket.set_nonblocking(true).is_err() {
                    return false;
                }
                self.socket = Some(socket);
                self.last_active = Instant::now();
                true
            }
            Err(_) => false,
        }
    }

    /// Raw descriptor for the poll array; `INVALID_SOCKET` when detached.
    pub fn fd(&self) -> RawFd {
        match self.socket {
            Some(ref socket) => socket.as_raw_fd(),
            None             => INVALID_SOCKET,
        }
    }

    /// Poll-event mask this connection is interested in.
    pub fn events(&self) -> libc::c_short {
        libc::POLLIN
    }

    /// Local address of the attached socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket {
            Some(ref socket) => socket.local_addr().ok(),
            None             => None,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn set_outgoing(&mut self, outgoing: bool) {
        self.outgoing = outgoing;
    }

    /// Sticky transport-error flag; set by a failed read or write.
    pub fn errors(&self) -> bool {
        self.errors
    }

    /// True once the connection has been idle for `limit` seconds.
    ///
    /// A limit of zero times out immediately; useful for tests.
    pub fn timeout(&self, limit: u64) -> bool {
        self.last_active.elapsed().as_secs() >= limit
    }

    /// Unparsed receive bytes, for the protocol's frame decoder.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Drain the socket into the receive buffer; returns bytes read.
    ///
    /// Returns `NetError::PeerClosed` on an orderly remote close.
    pub fn recv(&mut self) -> Result<usize, NetError> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let socket = match self.socket {
                Some(ref mut socket) => socket,
                None                 => return Ok(total),
            };

            match socket.read(&mut chunk) {
                Ok(0) => return Err(NetError::PeerClosed),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.last_active = Instant::now();
                    total += n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.errors = true;
                    return Err(NetError::Io(err));
                }
            }
        }
    }

    /// Queue bytes for the peer; [`flush`](Connection::flush) sends them.
    pub fn send(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    /// Write as much of the outbound buffer as the socket accepts.
    pub fn flush(&mut self) -> Result<(), NetError> {
        while !self.outbound.is_empty() {
            let written = {
                let socket = match self.socket {
                    Some(ref mut socket) => socket,
                    None                 => return Ok(()),
                };

                match socket.write(&self.outbound) {
                    Ok(n) => n,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        self.errors = true;
                        return Err(NetError::Io(err));
                    }
                }
            };
            self.outbound.drain(..written);
        }
        Ok(())
    }

    /// Drop the socket, ending the connection.
    pub fn close(&mut self) {
        if let Some(ref socket) = self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.socket = None;
        self.connected = false;
    }
}
