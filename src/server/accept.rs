use crossbeam::queue::ArrayQueue;
use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

/// Bookkeeping for one outstanding accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptDescriptor {
    pub port: u16,
    pub accepted: u64,
    pub failures: u64,
    pub last_peer: Option<SocketAddr>,
    pub last_error: Option<io::ErrorKind>,
}

impl AcceptDescriptor {
    #[inline]
    pub fn record_accept(&mut self, peer: SocketAddr) {
        self.accepted += 1;
        self.last_peer = Some(peer);
    }

    #[inline]
    pub fn record_failure(&mut self, err: &io::Error) {
        self.failures += 1;
        self.last_error = Some(err.kind());
    }
}

/// Totals reported by [`AcceptPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptStats {
    pub accepted: u64,
    pub failures: u64,
    /// Descriptors created because the pool was empty.
    pub overflows: u64,
    pub available: usize,
    pub capacity: usize,
}

/// Pre-allocated accept descriptors shared by every accept loop.
#[derive(Debug)]
pub struct AcceptPool {
    slots: ArrayQueue<AcceptDescriptor>,
    accepted: AtomicU64,
    failures: AtomicU64,
    overflows: AtomicU64,
}

impl AcceptPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = slots.push(AcceptDescriptor::default());
        }

        Self {
            slots,
            accepted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Takes a descriptor for an accept on `port`, creating one when the
    /// pool ran dry.
    pub fn take(&self, port: u16) -> AcceptDescriptor {
        let mut descriptor = self.slots.pop().unwrap_or_else(|| {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            AcceptDescriptor::default()
        });

        descriptor.port = port;
        descriptor
    }

    /// Returns a descriptor and folds its counters into the totals.
    ///
    /// The descriptor is dropped when the pool is already full.
    pub fn give(&self, mut descriptor: AcceptDescriptor) {
        self.accepted
            .fetch_add(std::mem::take(&mut descriptor.accepted), Ordering::Relaxed);
        self.failures
            .fetch_add(std::mem::take(&mut descriptor.failures), Ordering::Relaxed);

        let _ = self.slots.push(descriptor);
    }

    pub fn stats(&self) -> AcceptStats {
        AcceptStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            available: self.slots.len(),
            capacity: self.slots.capacity(),
        }
    }
}

#[cfg(test)]
mod accept_tests {
    use super::*;

    #[test]
    fn take_and_give() {
        let pool = AcceptPool::new(2);
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        let mut a = pool.take(8080);
        let mut b = pool.take(8443);
        assert_eq!((a.port, b.port), (8080, 8443));
        assert_eq!(pool.stats().available, 0);

        a.record_accept(peer);
        b.record_failure(&io::Error::from(io::ErrorKind::ConnectionAborted));
        assert_eq!(b.last_error, Some(io::ErrorKind::ConnectionAborted));

        pool.give(a);
        pool.give(b);

        #[rustfmt::skip]
        assert_eq!(pool.stats(), AcceptStats {
            accepted: 1, failures: 1, overflows: 0, available: 2, capacity: 2,
        });

        let reused = pool.take(9000);
        assert_eq!(reused.accepted, 0);
        assert_eq!(reused.port, 9000);
    }

    #[test]
    fn overflow_is_dropped_on_give() {
        let pool = AcceptPool::new(1);
        let first = pool.take(1);
        let extra = pool.take(1);
        assert_eq!(pool.stats().overflows, 1);

        pool.give(first);
        pool.give(extra);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn zero_capacity_keeps_one_slot() {
        assert_eq!(AcceptPool::new(0).stats().capacity, 1);
    }
}
