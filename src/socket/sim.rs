//! In-memory duplex transport for deterministic tests

use super::{Connector, Operation, Options, SocketIo, Stats};
use crate::queue::ByteQueue;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;

/// State of one simulated endpoint.
///
/// An endpoint runs at most one operation at a time. Every transition is a
/// compare-and-swap, so a peer observing the state never sees a torn update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SimState {
    Idle = 0,
    Receiving = 1,
    Sending = 2,
    Closed = 3,
}

impl SimState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SimState::Idle,
            1 => SimState::Receiving,
            2 => SimState::Sending,
            _ => SimState::Closed,
        }
    }
}

#[derive(Debug)]
struct Endpoint {
    inbox: Mutex<ByteQueue>,
    capacity: AtomicUsize,
    state: AtomicU8,
    wake: Notify,
    write_closed: AtomicBool,
    send_transitions: AtomicUsize,
}

impl Endpoint {
    fn new(capacity: usize) -> Self {
        Self {
            inbox: Mutex::new(ByteQueue::new()),
            capacity: AtomicUsize::new(capacity.max(1)),
            state: AtomicU8::new(SimState::Idle as u8),
            wake: Notify::new(),
            write_closed: AtomicBool::new(false),
            send_transitions: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn state(&self) -> SimState {
        SimState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn transition(&self, from: SimState, to: SimState) -> Result<(), SimState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SimState::from_u8)
    }

    /// Wakes this endpoint if it is parked in an operation.
    ///
    /// Called by the peer after it changed something this endpoint may be
    /// waiting on: data added to our inbox, or space freed in the peer's.
    #[inline]
    fn try_set_unidle(&self) -> bool {
        match self.state() {
            SimState::Receiving | SimState::Sending => {
                self.wake.notify_one();
                true
            }
            _ => false,
        }
    }
}

/// Resets the endpoint to `Idle` when an operation finishes or is dropped.
struct OpGuard<'a> {
    endpoint: &'a Endpoint,
    active: SimState,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let _ = self.endpoint.transition(self.active, SimState::Idle);
    }
}

/// One end of an in-memory connection created by [`SimSocket::pair`].
///
/// Each endpoint owns an inbox bounded by its receive buffer size. A sender
/// facing a full inbox parks until the peer drains it, and the draining side
/// wakes the parked sender before returning.
#[derive(Debug)]
pub struct SimSocket {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    options: Options,
    stats: Stats,
}

impl SimSocket {
    /// Creates two connected endpoints whose inboxes hold `capacity` bytes each.
    pub fn pair(capacity: usize) -> (SimSocket, SimSocket) {
        let a = Arc::new(Endpoint::new(capacity));
        let b = Arc::new(Endpoint::new(capacity));

        let options = Options {
            recv_buffer_size: capacity,
            send_buffer_size: capacity,
            ..Options::default()
        };

        (
            SimSocket {
                local: a.clone(),
                remote: b.clone(),
                options: options.clone(),
                stats: Stats::default(),
            },
            SimSocket {
                local: b,
                remote: a,
                options,
                stats: Stats::default(),
            },
        )
    }

    #[inline]
    pub fn state(&self) -> SimState {
        self.local.state()
    }

    /// Number of times this endpoint has entered `Sending`.
    #[inline]
    pub fn send_transitions(&self) -> usize {
        self.local.send_transitions.load(Ordering::Relaxed)
    }

    #[track_caller]
    fn enter(&self, target: SimState) -> io::Result<OpGuard<'_>> {
        match self.local.transition(SimState::Idle, target) {
            Ok(()) => Ok(OpGuard {
                endpoint: &self.local,
                active: target,
            }),
            Err(SimState::Closed) => Err(io::ErrorKind::NotConnected.into()),
            Err(current) => panic!(
                "simulated socket is already {current:?}, cannot start {target:?}"
            ),
        }
    }

    fn drain_inbox(&self, buf: &mut [u8]) -> Option<usize> {
        let n = {
            let mut inbox = self.local.inbox.lock();
            if inbox.is_empty() {
                return None;
            }

            let n = buf.len().min(inbox.len());
            buf[..n].copy_from_slice(&inbox.as_slice()[..n]);
            inbox.remove(n);
            n
        };

        // The peer's parked sender must be released before this side moves on.
        self.remote.try_set_unidle();
        Some(n)
    }

    fn fill_peer(&self, buf: &[u8]) -> usize {
        let n = {
            let mut inbox = self.remote.inbox.lock();
            let room = self
                .remote
                .capacity
                .load(Ordering::Relaxed)
                .saturating_sub(inbox.len());

            let n = room.min(buf.len());
            inbox.add(&buf[..n]);
            n
        };

        if n != 0 {
            self.remote.try_set_unidle();
        }
        n
    }

    #[inline]
    fn peer_gone(&self) -> bool {
        self.remote.state() == SimState::Closed
    }

    fn release(&self) {
        self.local.write_closed.store(true, Ordering::Release);
        self.local.state.store(SimState::Closed as u8, Ordering::Release);
        self.local.inbox.lock().clear();
        self.remote.wake.notify_one();
    }

    async fn send_parked(&self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.enter(SimState::Sending)?;
        self.local.send_transitions.fetch_add(1, Ordering::Relaxed);

        loop {
            if self.peer_gone() || self.local.write_closed.load(Ordering::Acquire) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }

            let wake = self.local.wake.notified();
            match self.fill_peer(buf) {
                0 => wake.await,
                n => return Ok(n),
            }
        }
    }

    async fn receive_parked(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _guard = self.enter(SimState::Receiving)?;

        loop {
            let wake = self.local.wake.notified();

            if let Some(n) = self.drain_inbox(buf) {
                return Ok(n);
            }
            if buf.is_empty() || self.remote.write_closed.load(Ordering::Acquire) {
                return Ok(0);
            }

            wake.await;
        }
    }
}

impl SocketIo for SimSocket {
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Send);
        if buf.is_empty() {
            return self.stats.record(Ok(0), |n| *n);
        }

        let result = self.send_parked(buf).await;
        self.stats.record(result, |n| *n)
    }

    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Receive);
        let result = self.receive_parked(buf).await;
        self.stats.record(result, |n| *n)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Send);
        let result = if self.state() == SimState::Closed {
            Err(io::ErrorKind::NotConnected.into())
        } else if buf.is_empty() {
            Ok(0)
        } else if self.peer_gone() || self.local.write_closed.load(Ordering::Acquire) {
            Err(io::ErrorKind::BrokenPipe.into())
        } else {
            match self.fill_peer(buf) {
                0 => Err(io::ErrorKind::WouldBlock.into()),
                n => Ok(n),
            }
        };
        self.stats.record(result, |n| *n)
    }

    fn try_receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Receive);
        let result = if self.state() == SimState::Closed {
            Err(io::ErrorKind::NotConnected.into())
        } else if let Some(n) = self.drain_inbox(buf) {
            Ok(n)
        } else if self.remote.write_closed.load(Ordering::Acquire) {
            Ok(0)
        } else {
            Err(io::ErrorKind::WouldBlock.into())
        };
        self.stats.record(result, |n| *n)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stats.begin(Operation::Disconnect);
        self.local.write_closed.store(true, Ordering::Release);
        self.remote.wake.notify_one();
        Ok(())
    }

    fn close(&mut self) {
        self.stats.begin(Operation::Close);
        self.release();
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.options.read_timeout
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.options.read_timeout = timeout;
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.options.write_timeout
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.options.write_timeout = timeout;
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(self.local.capacity.load(Ordering::Relaxed))
    }

    fn set_recv_buffer_size(&mut self, size: usize) -> io::Result<()> {
        self.options.recv_buffer_size = size;
        self.local.capacity.store(size.max(1), Ordering::Relaxed);
        Ok(())
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(self.options.send_buffer_size)
    }

    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        self.options.send_buffer_size = size;
        Ok(())
    }

    fn keepalive(&self) -> io::Result<bool> {
        Ok(self.options.keepalive)
    }

    fn set_keepalive(&mut self, enabled: bool) -> io::Result<()> {
        self.options.keepalive = enabled;
        Ok(())
    }

    fn linger(&self) -> io::Result<Option<Duration>> {
        Ok(self.options.linger)
    }

    fn set_linger(&mut self, linger: Option<Duration>) -> io::Result<()> {
        self.options.linger = linger;
        Ok(())
    }

    fn nodelay(&self) -> io::Result<bool> {
        Ok(self.options.nodelay)
    }

    fn set_nodelay(&mut self, enabled: bool) -> io::Result<()> {
        self.options.nodelay = enabled;
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.local.inbox.lock().len())
    }

    fn is_connected(&self) -> bool {
        self.state() != SimState::Closed && !self.peer_gone()
    }

    fn last_operation(&self) -> Operation {
        self.stats.last_operation
    }

    fn last_error(&self) -> Option<io::ErrorKind> {
        self.stats.last_error
    }

    fn bytes_transferred(&self) -> usize {
        self.stats.transferred
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.release();
    }
}

/// [`Connector`] handing out pre-made simulated sockets in order.
#[derive(Debug, Default)]
pub struct SimConnector {
    sockets: Mutex<VecDeque<SimSocket>>,
    targets: Mutex<Vec<String>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the socket returned by the next `connect`.
    pub fn push(&self, socket: SimSocket) {
        self.sockets.lock().push_back(socket);
    }

    /// Targets passed to `connect` so far.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }
}

impl Connector for SimConnector {
    type Socket = SimSocket;

    async fn connect(&self, target: &str) -> io::Result<SimSocket> {
        self.targets.lock().push(target.to_owned());

        let socket = self.sockets.lock().pop_front();
        socket.ok_or_else(|| io::ErrorKind::ConnectionRefused.into())
    }
}

#[cfg(test)]
mod sim_tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn zero_byte_send_is_synchronous() {
        let (mut a, _b) = SimSocket::pair(16);

        assert_eq!(a.send(&[]).await.unwrap(), 0);
        assert_eq!(a.send_transitions(), 0);
        assert_eq!(a.state(), SimState::Idle);
        assert_eq!(a.last_operation(), Operation::Send);

        assert_eq!(a.send(b"x").await.unwrap(), 1);
        assert_eq!(a.send_transitions(), 1);
        assert_eq!(a.state(), SimState::Idle);
    }

    #[tokio::test]
    async fn duplex() {
        let (mut a, mut b) = SimSocket::pair(64);
        let mut buf = [0u8; 64];

        a.send_all(b"hello").await.unwrap();
        assert_eq!(b.bytes_available().unwrap(), 5);
        assert_eq!(b.receive(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        b.send_all(b"world").await.unwrap();
        assert_eq!(a.receive(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(a.bytes_transferred(), 5);
    }

    #[tokio::test]
    async fn receiver_wakes_on_data() {
        let (mut a, mut b) = SimSocket::pair(64);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = b.receive(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        tokio::task::yield_now().await;
        a.send_all(b"late").await.unwrap();

        assert_eq!(reader.await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn full_inbox_parks_sender() {
        let (mut a, mut b) = SimSocket::pair(4);

        let writer = tokio::spawn(async move {
            a.send_all(b"0123456789").await.unwrap();
            a
        });

        let mut got = Vec::new();
        let mut buf = [0u8; 3];
        while got.len() < 10 {
            let n = b.receive(&mut buf).await.unwrap();
            assert!(n <= 3);
            got.extend_from_slice(&buf[..n]);
        }

        assert_eq!(got, b"0123456789");
        let a = writer.await.unwrap();
        assert!(a.send_transitions() >= 3);
    }

    #[tokio::test]
    async fn close_ends_peer_receive() {
        let (mut a, mut b) = SimSocket::pair(16);
        a.send_all(b"tail").await.unwrap();
        a.close();

        let mut buf = [0u8; 16];
        assert_eq!(b.receive(&mut buf).await.unwrap(), 4);
        assert_eq!(b.receive(&mut buf).await.unwrap(), 0);
        assert!(!b.is_connected());

        let err = b.send(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err = a.receive(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn drop_ends_parked_peer() {
        let (a, mut b) = SimSocket::pair(16);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = b.receive(&mut buf).await.unwrap();
            (n, b)
        });

        tokio::task::yield_now().await;
        drop(a);

        let (n, mut b) = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(!b.is_connected());

        let err = b.send(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn drop_releases_parked_sender() {
        let (mut a, b) = SimSocket::pair(2);

        let writer = tokio::spawn(async move { a.send_all(b"overflow").await });

        tokio::task::yield_now().await;
        drop(b);

        let sent = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(sent.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn shutdown_is_half_close() {
        let (mut a, mut b) = SimSocket::pair(16);
        a.shutdown().await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.receive(&mut buf).await.unwrap(), 0);

        b.send_all(b"ok").await.unwrap();
        assert_eq!(a.receive(&mut buf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn try_variants() {
        let (mut a, mut b) = SimSocket::pair(2);
        let mut buf = [0u8; 4];

        let err = b.try_receive(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(a.try_send(b"abc").unwrap(), 2);
        let err = a.try_send(b"c").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(b.try_receive(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[tokio::test]
    async fn dropped_receive_returns_to_idle() {
        let (_a, mut b) = SimSocket::pair(16);
        let mut buf = [0u8; 4];

        let pending = timeout(Duration::from_millis(5), b.receive(&mut buf)).await;
        assert!(pending.is_err());
        assert_eq!(b.state(), SimState::Idle);
    }

    #[tokio::test]
    #[should_panic(expected = "simulated socket is already Receiving")]
    async fn second_operation_panics() {
        let (_a, mut b) = SimSocket::pair(16);
        let mut first = [0u8; 4];
        let mut second = [0u8; 4];

        let mut leaked = Box::pin(b.receive(&mut first));
        let _ = timeout(Duration::from_millis(5), &mut leaked).await;
        std::mem::forget(leaked);

        let _ = b.receive(&mut second).await;
    }
}
