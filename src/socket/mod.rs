//! Swappable transport facade
//!
//! The engine only talks to sockets through [`SocketIo`], so the same
//! protocol code runs over a real [`TcpSocket`] or over an in-memory
//! [`SimSocket`] pair in tests.

pub mod sim;
pub mod tcp;

use crate::limits::ConnLimits;
use std::{future::Future, io, net::SocketAddr, time::Duration};

pub use sim::{SimConnector, SimSocket, SimState};
pub use tcp::{TcpConnector, TcpSocket};

/// The last operation started on a socket, as reported by
/// [`SocketIo::last_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operation {
    #[default]
    None,
    Connect,
    Send,
    Receive,
    Disconnect,
    Close,
}

/// Raw socket operations the engine needs.
///
/// Async operations return `Send` futures so connection tasks can move
/// between runtime workers.
pub trait SocketIo: Send + 'static {
    /// Sends some of `buf` and returns how many bytes were written.
    ///
    /// An empty `buf` completes immediately with `Ok(0)`.
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receives up to `buf.len()` bytes. `Ok(0)` means the peer closed its side.
    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Non-blocking send. Fails with `WouldBlock` when nothing can be written now.
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Non-blocking receive. Fails with `WouldBlock` when nothing is available.
    fn try_receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Orderly shutdown of the write side.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Closes the socket immediately. Pending and later operations fail or
    /// observe end of stream.
    fn close(&mut self);

    fn read_timeout(&self) -> Option<Duration>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>);
    fn write_timeout(&self) -> Option<Duration>;
    fn set_write_timeout(&mut self, timeout: Option<Duration>);

    fn recv_buffer_size(&self) -> io::Result<usize>;
    fn set_recv_buffer_size(&mut self, size: usize) -> io::Result<()>;
    fn send_buffer_size(&self) -> io::Result<usize>;
    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()>;

    fn keepalive(&self) -> io::Result<bool>;
    fn set_keepalive(&mut self, enabled: bool) -> io::Result<()>;
    fn linger(&self) -> io::Result<Option<Duration>>;
    fn set_linger(&mut self, linger: Option<Duration>) -> io::Result<()>;
    fn nodelay(&self) -> io::Result<bool>;
    fn set_nodelay(&mut self, enabled: bool) -> io::Result<()>;

    /// Bytes that can be received right now without waiting.
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn is_connected(&self) -> bool;
    fn last_operation(&self) -> Operation;
    fn last_error(&self) -> Option<io::ErrorKind>;
    /// Bytes moved by the last completed send or receive.
    fn bytes_transferred(&self) -> usize;
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Writes all of `buf`, looping on partial sends.
    fn send_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send
    where
        Self: Sized,
    {
        async move {
            let mut buf = buf;
            while !buf.is_empty() {
                match self.send(buf).await? {
                    0 => return Err(io::ErrorKind::WriteZero.into()),
                    n => buf = &buf[n..],
                }
            }
            Ok(())
        }
    }

    /// Applies the per-connection socket options from `limits`.
    fn configure(&mut self, limits: &ConnLimits) -> io::Result<()>
    where
        Self: Sized,
    {
        self.set_recv_buffer_size(limits.socket_buffer_size)?;
        self.set_send_buffer_size(limits.socket_buffer_size)?;
        self.set_keepalive(limits.keepalive)?;
        self.set_nodelay(limits.no_delay)?;
        self.set_linger(limits.linger)
    }
}

/// Opens outbound connections for the splice pool.
pub trait Connector: Send + Sync + 'static {
    type Socket: SocketIo;

    fn connect(&self, target: &str) -> impl Future<Output = io::Result<Self::Socket>> + Send;
}

/// Option values kept by sockets that have no OS-level counterpart for them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Options {
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) recv_buffer_size: usize,
    pub(crate) send_buffer_size: usize,
    pub(crate) keepalive: bool,
    pub(crate) linger: Option<Duration>,
    pub(crate) nodelay: bool,
}

/// Bookkeeping shared by both socket implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stats {
    pub(crate) last_operation: Operation,
    pub(crate) last_error: Option<io::ErrorKind>,
    pub(crate) transferred: usize,
}

impl Stats {
    #[inline]
    pub(crate) fn begin(&mut self, op: Operation) {
        self.last_operation = op;
    }

    #[inline]
    pub(crate) fn record<T>(&mut self, result: io::Result<T>, count: impl Fn(&T) -> usize) -> io::Result<T> {
        match &result {
            Ok(value) => {
                self.transferred = count(value);
                self.last_error = None;
            }
            Err(err) => {
                self.transferred = 0;
                self.last_error = Some(err.kind());
            }
        }
        result
    }
}
