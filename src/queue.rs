//! FIFO byte buffer used for every rx/tx path in the engine

use bytes::{Buf, Bytes, BytesMut};
use memchr::{memchr, memmem};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::sync::Notify;

/// Byte queue shared between a producer and a consumer on different tasks.
///
/// The mutex is the queue's sync root: lock it for the duration of one
/// mutation, never across an `.await`.
pub type SharedQueue = Arc<Mutex<ByteQueue>>;

/// Growable FIFO byte buffer with random-access peek and a movable cursor.
///
/// The cursor (`position`) is an offset into the unread bytes. It follows the
/// data: removing `n` bytes from the front moves it back by `n`, saturating at
/// zero. Searches such as [`index_of`](Self::index_of) start at the cursor,
/// which lets a parser resume scanning where it stopped.
///
/// Every removal that leaves the queue empty fires the
/// [`drained`](Self::drained) signal.
pub struct ByteQueue {
    buf: BytesMut,
    position: usize,
    drained: Arc<Notify>,
}

impl ByteQueue {
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            position: 0,
            drained: Arc::new(Notify::new()),
        }
    }

    /// Creates a queue wrapped in its sync root.
    #[inline]
    pub fn shared() -> SharedQueue {
        Arc::new(Mutex::new(Self::new()))
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends `data` to the back of the queue.
    #[inline]
    pub fn add(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discards up to `count` bytes from the front and returns how many were removed.
    #[inline]
    pub fn remove(&mut self, count: usize) -> usize {
        let count = count.min(self.buf.len());
        self.buf.advance(count);
        self.after_remove(count);
        count
    }

    /// Removes exactly `count` bytes, or nothing if fewer are queued.
    #[inline]
    pub fn remove_exact(&mut self, count: usize) -> Option<Bytes> {
        if count > self.buf.len() {
            return None;
        }

        let value = self.buf.split_to(count).freeze();
        self.after_remove(count);
        Some(value)
    }

    #[inline]
    pub fn remove_all(&mut self) -> Bytes {
        let count = self.buf.len();
        let value = self.buf.split().freeze();
        self.after_remove(count);
        value
    }

    /// Moves `count` bytes (everything when `None`) to the back of `other`.
    ///
    /// Returns the number of bytes moved.
    pub fn move_to(&mut self, other: &mut ByteQueue, count: Option<usize>) -> usize {
        let count = count.unwrap_or(usize::MAX).min(self.buf.len());
        if count == 0 {
            return 0;
        }

        if other.is_empty() && count == self.buf.len() {
            // Whole-buffer move: hand the allocation over instead of copying.
            let taken = self.buf.split();
            other.buf.unsplit(taken);
        } else {
            other.buf.extend_from_slice(&self.buf[..count]);
            self.buf.advance(count);
        }

        self.after_remove(count);
        count
    }

    /// Position of the first `byte` at or after the cursor.
    #[inline]
    pub fn index_of(&self, byte: u8) -> Option<usize> {
        let start = self.position.min(self.buf.len());
        memchr(byte, &self.buf[start..]).map(|i| i + start)
    }

    /// Position of the first occurrence of `needle` at or after the cursor.
    #[inline]
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        let start = self.position.min(self.buf.len());
        memmem::find(&self.buf[start..], needle).map(|i| i + start)
    }

    #[inline(always)]
    pub fn peek(&self, index: usize) -> Option<u8> {
        self.buf.get(index).copied()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor, clamped to the number of queued bytes.
    #[inline]
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.buf.len());
    }

    /// Signal fired each time a removal empties the queue.
    ///
    /// Only tasks already waiting are woken, so check [`is_empty`](Self::is_empty)
    /// after creating the `Notified` future and before awaiting it.
    #[inline]
    pub fn drained(&self) -> Arc<Notify> {
        self.drained.clone()
    }

    /// Drops every queued byte and rewinds the cursor.
    pub fn clear(&mut self) {
        let count = self.buf.len();
        self.buf.clear();
        self.after_remove(count);
        self.position = 0;
    }

    #[inline]
    fn after_remove(&mut self, count: usize) {
        self.position = self.position.saturating_sub(count);

        if count != 0 && self.buf.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteQueue")
            .field("len", &self.buf.len())
            .field("position", &self.position)
            .finish()
    }
}

impl From<&[u8]> for ByteQueue {
    fn from(value: &[u8]) -> Self {
        let mut queue = Self::with_capacity(value.len());
        queue.add(value);
        queue
    }
}
