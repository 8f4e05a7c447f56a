//! Exact-length reads and whole writes over a [`SocketIo`]
//!
//! A record-oriented engine (TLS) asks for "exactly N bytes" and "all of
//! this buffer", while sockets hand out whatever arrived. The adapter
//! bridges the two with a staging queue. Reads never take more from the
//! socket than they still need, so bytes past the current read stay in the
//! socket. Bytes that arrived before the engine took over (e.g. while
//! sniffing for a handshake) are staged up front and consumed first.

use crate::{queue::ByteQueue, socket::SocketIo};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    fmt, io,
    sync::atomic::{AtomicU8, Ordering},
};

const READ_CHUNK: usize = 16 * 1024;

/// The one operation an adapter may have outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdapterState {
    Idle = 0,
    Reading = 1,
    Writing = 2,
}

impl AdapterState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AdapterState::Idle,
            1 => AdapterState::Reading,
            _ => AdapterState::Writing,
        }
    }
}

/// Staging buffer plus a tri-state guard over one outstanding operation.
///
/// Starting a read or write while another one is outstanding is a bug in
/// the caller and panics.
pub struct StreamAdapter {
    state: AtomicU8,
    staging: Mutex<ByteQueue>,
}

impl StreamAdapter {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(AdapterState::Idle as u8),
            staging: Mutex::new(ByteQueue::new()),
        }
    }

    #[inline]
    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[track_caller]
    fn enter(&self, target: AdapterState) {
        let swapped = self.state.compare_exchange(
            AdapterState::Idle as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if let Err(current) = swapped {
            panic!(
                "stream adapter is already {:?}, cannot start {target:?}",
                AdapterState::from_u8(current)
            );
        }
    }

    #[inline]
    fn leave(&self) {
        self.state.store(AdapterState::Idle as u8, Ordering::Release);
    }

    /// Starts reading exactly `count` bytes.
    #[track_caller]
    pub fn begin_read(&self, count: usize) -> ReadOp<'_> {
        self.enter(AdapterState::Reading);
        ReadOp {
            adapter: self,
            count,
        }
    }

    /// Starts writing all of `data`. The bytes are copied.
    #[track_caller]
    pub fn begin_write(&self, data: &[u8]) -> WriteOp<'_> {
        self.enter(AdapterState::Writing);
        WriteOp {
            adapter: self,
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Adds bytes that later reads consume before touching the socket.
    pub fn stage(&self, data: &[u8]) {
        self.staging.lock().add(data);
    }

    #[inline]
    pub fn staged(&self) -> usize {
        self.staging.lock().len()
    }

    /// Moves staged-but-unconsumed bytes to the back of `rx`.
    pub fn drain_into(&self, rx: &mut ByteQueue) -> usize {
        self.staging.lock().move_to(rx, None)
    }
}

impl Default for StreamAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAdapter")
            .field("state", &self.state())
            .field("staged", &self.staged())
            .finish()
    }
}

/// An outstanding exact-length read. Dropping it returns the adapter to idle.
#[must_use = "a read does nothing until `end` is awaited"]
pub struct ReadOp<'a> {
    adapter: &'a StreamAdapter,
    count: usize,
}

impl ReadOp<'_> {
    /// `true` when the staged bytes already satisfy the read.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.adapter.staged() >= self.count
    }

    /// Receives until `count` bytes are staged and returns exactly those.
    ///
    /// Fails with `ConnectionReset` if the peer closes first. Cancelling
    /// the future keeps whatever was already received staged.
    pub async fn end<S: SocketIo>(self, socket: &mut S) -> io::Result<Bytes> {
        let mut chunk = Vec::new();

        loop {
            let missing = {
                let mut staging = self.adapter.staging.lock();
                if let Some(bytes) = staging.remove_exact(self.count) {
                    return Ok(bytes);
                }
                self.count - staging.len()
            };

            chunk.resize(missing.clamp(1, READ_CHUNK), 0);
            let n = socket.receive(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            self.adapter.staging.lock().add(&chunk[..n]);
        }
    }
}

impl Drop for ReadOp<'_> {
    fn drop(&mut self) {
        self.adapter.leave();
    }
}

/// An outstanding whole-buffer write. Dropping it returns the adapter to idle.
#[must_use = "a write does nothing until `end` is awaited"]
pub struct WriteOp<'a> {
    adapter: &'a StreamAdapter,
    data: Bytes,
}

impl WriteOp<'_> {
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.data.is_empty()
    }

    pub async fn end<S: SocketIo>(self, socket: &mut S) -> io::Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        socket.send_all(&self.data).await
    }
}

impl Drop for WriteOp<'_> {
    fn drop(&mut self) {
        self.adapter.leave();
    }
}

#[cfg(test)]
mod adapter_tests {
    use super::*;
    use crate::socket::SimSocket;

    #[tokio::test]
    async fn exact_reads() {
        let (mut client, mut server) = SimSocket::pair(64);
        let adapter = StreamAdapter::new();

        adapter.stage(b"head");
        client.send_all(b"erbody+next").await.unwrap();

        let header = adapter.begin_read(6).end(&mut server).await.unwrap();
        assert_eq!(&header[..], b"header");
        assert_eq!(adapter.state(), AdapterState::Idle);

        let read = adapter.begin_read(4);
        assert!(!read.is_completed());
        assert_eq!(&read.end(&mut server).await.unwrap()[..], b"body");

        // Nothing past the requested bytes was taken from the socket.
        assert_eq!(adapter.staged(), 0);
        let mut buf = [0u8; 8];
        let n = server.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+next");
    }

    #[tokio::test]
    async fn staged_bytes_served_first() {
        let (_client, mut server) = SimSocket::pair(64);
        let adapter = StreamAdapter::new();
        adapter.stage(b"+next");

        let read = adapter.begin_read(2);
        assert!(read.is_completed());
        assert_eq!(&read.end(&mut server).await.unwrap()[..], b"+n");

        let mut rx = ByteQueue::from(&b"abc"[..]);
        assert_eq!(adapter.drain_into(&mut rx), 3);
        assert_eq!(rx.as_slice(), b"abcext");
    }

    #[tokio::test]
    async fn read_spans_receives() {
        let (mut client, mut server) = SimSocket::pair(64);
        let adapter = StreamAdapter::new();
        adapter.stage(b"ab");

        let reader = async {
            let read = adapter.begin_read(6);
            assert!(!read.is_completed());
            read.end(&mut server).await
        };
        let writer = async {
            client.send_all(b"cd").await.unwrap();
            tokio::task::yield_now().await;
            client.send_all(b"ef").await.unwrap();
        };

        let (read, _) = tokio::join!(reader, writer);
        assert_eq!(&read.unwrap()[..], b"abcdef");
    }

    #[tokio::test]
    async fn peer_close_is_reset() {
        let (client, mut server) = SimSocket::pair(64);
        let adapter = StreamAdapter::new();
        drop(client);

        let err = adapter.begin_read(5).end(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(adapter.state(), AdapterState::Idle);
    }

    #[tokio::test]
    async fn writes() {
        let (mut client, mut server) = SimSocket::pair(64);
        let adapter = StreamAdapter::new();

        let empty = adapter.begin_write(b"");
        assert!(empty.is_completed());
        empty.end(&mut server).await.unwrap();

        adapter.begin_write(b"record").end(&mut server).await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"record");
    }

    #[test]
    #[should_panic(expected = "stream adapter is already Reading, cannot start Writing")]
    fn overlapping_operations() {
        let adapter = StreamAdapter::new();
        let _read = adapter.begin_read(5);
        let _write = adapter.begin_write(b"x");
    }

    #[test]
    fn dropped_operation_returns_to_idle() {
        let adapter = StreamAdapter::new();
        drop(adapter.begin_read(5));
        assert_eq!(adapter.state(), AdapterState::Idle);

        let _write = adapter.begin_write(b"x");
        assert_eq!(adapter.state(), AdapterState::Writing);
    }
}
