use super::handler::{Handler, Liveness, Protocol};
use crate::limits::ConnLimits;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Reusable handler instances of one protocol.
///
/// Every instance the pool created is either idle (queued for reuse) or
/// active (taken by [`pop`](Self::pop) and not yet returned). Active
/// sessions are tracked by their [`Liveness`] so the maintenance sweep can
/// force-close those whose stage deadline passed.
///
/// ```text
///   pop ──> [ active-set ] ── push ──> reset ──> [ idle queue ] ──> pop
///                 │
///           sweep: overdue? ──> force close
/// ```
pub struct HandlerPool<P: Protocol> {
    idle: SegQueue<Handler<P>>,
    active: Mutex<HashMap<u64, Arc<Liveness>>>,
    factory: Box<dyn Fn() -> P + Send + Sync>,
    limits: ConnLimits,
    ceiling: usize,
    created: AtomicUsize,
    stopping: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Protocol> HandlerPool<P> {
    /// Creates a pool that builds instances with `factory`.
    ///
    /// `ceiling` bounds the number of instances alive at once, `0` means
    /// unlimited. `limits.initial_timeout` is armed on every popped handler.
    pub fn new<F>(factory: F, limits: ConnLimits, ceiling: usize) -> Arc<Self>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        Arc::new(Self {
            idle: SegQueue::new(),
            active: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
            limits,
            ceiling,
            created: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        })
    }

    /// Creates up to `count` idle instances ahead of time.
    pub fn prefill(&self, count: usize) -> usize {
        let mut added = 0;
        while added < count {
            let Some(handler) = self.create() else {
                break;
            };
            self.idle.push(handler);
            added += 1;
        }
        added
    }

    fn create(&self) -> Option<Handler<P>> {
        let ceiling = self.ceiling;
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (ceiling == 0 || count < ceiling).then_some(count + 1)
            })
            .ok()?;

        Some(Handler::new((self.factory)()))
    }

    /// Takes an idle handler, creating one if the ceiling allows.
    ///
    /// Returns `None` when the pool is exhausted or stopping.
    pub fn pop(&self) -> Option<Handler<P>> {
        if self.is_stopping() {
            return None;
        }

        let mut handler = match self.idle.pop() {
            Some(handler) => handler,
            None => self.create()?,
        };

        handler.renew();
        handler.liveness().arm(self.limits.initial_timeout, true);
        self.active
            .lock()
            .insert(handler.id(), handler.liveness().clone());

        trace!(handler_id = handler.id(), "handler taken from pool");
        Some(handler)
    }

    /// Like [`pop`](Self::pop), but the handler returns to the pool when
    /// the lease is dropped.
    pub fn lease(&self) -> Option<Lease<'_, P>> {
        Some(Lease {
            pool: self,
            handler: Some(self.pop()?),
        })
    }

    /// Returns a handler taken from this pool.
    ///
    /// The handler is reset, then either queued for reuse or, once the pool
    /// is stopping, disposed. Handlers this pool does not consider active are
    /// rejected and dropped, and `false` is returned.
    pub fn push(&self, mut handler: Handler<P>) -> bool {
        if self.active.lock().remove(&handler.id()).is_none() {
            warn!(handler_id = handler.id(), "rejected handler not taken from this pool");
            return false;
        }

        handler.reset();
        match self.is_stopping() {
            true => self.dispose(handler),
            false => {
                trace!(handler_id = handler.id(), "handler returned to pool");
                self.idle.push(handler);
            }
        }
        true
    }

    /// Drops the bookkeeping of an active handler that will never come
    /// back, such as one lost to a panic. Its slot under the ceiling is
    /// freed.
    pub fn forget(&self, id: u64) -> bool {
        if self.active.lock().remove(&id).is_none() {
            return false;
        }
        self.created.fetch_sub(1, Ordering::AcqRel);
        warn!(handler_id = id, "active handler lost, slot released");
        true
    }

    fn dispose(&self, handler: Handler<P>) {
        trace!(handler_id = handler.id(), "handler disposed");
        drop(handler);
        self.created.fetch_sub(1, Ordering::AcqRel);
    }

    /// Starts the periodic timeout sweep on the current runtime.
    ///
    /// The task holds a weak reference and ends with the pool.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let pool = Arc::downgrade(self);
        let task = tokio::spawn(maintain(pool, interval));

        if let Some(previous) = self.maintenance.lock().replace(task) {
            previous.abort();
        }
    }

    /// Force-closes every active session whose stage deadline passed.
    ///
    /// The active-set is only locked while taking a snapshot, so pushes and
    /// pops are never blocked behind the close notifications.
    pub fn sweep(&self) -> usize {
        let overdue: Vec<Arc<Liveness>> = self
            .active
            .lock()
            .values()
            .filter(|liveness| !liveness.is_closed() && liveness.is_overdue())
            .cloned()
            .collect();

        for liveness in &overdue {
            debug!(
                handler_id = liveness.id(),
                idle = ?liveness.idle(),
                deadline = ?liveness.deadline(),
                "closing overdue connection"
            );
            liveness.close();
        }
        overdue.len()
    }

    /// Stops handing out handlers and disposes the idle ones.
    ///
    /// Active handlers keep running; they are disposed as they come back.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }

        while let Some(handler) = self.idle.pop() {
            self.dispose(handler);
        }
        debug!(active = self.active_len(), "handler pool stopped");
    }

    /// Force-closes every active session. Returns how many were signalled.
    pub fn close_active(&self) -> usize {
        let active: Vec<Arc<Liveness>> = self.active.lock().values().cloned().collect();
        for liveness in &active {
            liveness.close();
        }
        active.len()
    }

    /// Instances currently alive (idle plus active).
    #[inline]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    #[inline]
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    #[inline]
    pub fn active_len(&self) -> usize {
        self.active.lock().len()
    }

    #[inline]
    pub fn is_active(&self, id: u64) -> bool {
        self.active.lock().contains_key(&id)
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    #[inline]
    pub fn limits(&self) -> &ConnLimits {
        &self.limits
    }
}

async fn maintain<P: Protocol>(pool: Weak<HandlerPool<P>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_stopping() {
            break;
        }
        pool.sweep();
    }
}

impl<P: Protocol> Drop for HandlerPool<P> {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.get_mut().take() {
            task.abort();
        }
    }
}

impl<P: Protocol> fmt::Debug for HandlerPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPool")
            .field("ceiling", &self.ceiling)
            .field("created", &self.created())
            .field("idle", &self.idle_len())
            .field("active", &self.active_len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// A handler on loan from a [`HandlerPool`], returned on drop.
///
/// The handler also goes back when the future holding the lease is
/// cancelled. When the lease is dropped by a panic the handler is not
/// reset or reused; the pool forgets it instead.
pub struct Lease<'a, P: Protocol> {
    pool: &'a HandlerPool<P>,
    handler: Option<Handler<P>>,
}

impl<'a, P: Protocol> Lease<'a, P> {
    /// Wraps a handler already taken with [`HandlerPool::pop`].
    pub fn adopt(pool: &'a HandlerPool<P>, handler: Handler<P>) -> Self {
        Self {
            pool,
            handler: Some(handler),
        }
    }
}

impl<P: Protocol> Deref for Lease<'_, P> {
    type Target = Handler<P>;

    fn deref(&self) -> &Handler<P> {
        match &self.handler {
            Some(handler) => handler,
            None => unreachable!("lease is only emptied on drop"),
        }
    }
}

impl<P: Protocol> DerefMut for Lease<'_, P> {
    fn deref_mut(&mut self) -> &mut Handler<P> {
        match &mut self.handler {
            Some(handler) => handler,
            None => unreachable!("lease is only emptied on drop"),
        }
    }
}

impl<P: Protocol> Drop for Lease<'_, P> {
    fn drop(&mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        match std::thread::panicking() {
            true => {
                self.pool.forget(handler.id());
            }
            false => {
                self.pool.push(handler);
            }
        }
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::{Action, Context, SocketIo};

    #[derive(Default)]
    struct Counter {
        seen: usize,
    }

    impl Protocol for Counter {
        fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::Receive(0)
        }

        fn receive<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            self.seen += 1;
            Action::Receive(0)
        }

        fn reset(&mut self) {
            self.seen = 0;
        }
    }

    fn limits(initial: u64) -> ConnLimits {
        ConnLimits {
            initial_timeout: Duration::from_secs(initial),
            ..ConnLimits::default()
        }
    }

    #[test]
    fn ceiling_and_reuse() {
        let pool = HandlerPool::new(Counter::default, limits(30), 2);

        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        assert!(pool.pop().is_none());
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.active_len(), 2);

        let a_id = a.id();
        assert!(pool.push(a));
        assert!(!pool.is_active(a_id));
        assert_eq!(pool.idle_len(), 1);

        let again = pool.pop().unwrap();
        assert_eq!(again.id(), a_id);
        assert!(pool.is_active(a_id));
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.created(), 2);

        assert!(pool.push(again));
        assert!(pool.push(b));
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(pool.active_len(), 0);
    }

    #[test]
    fn unlimited_and_prefill() {
        let pool = HandlerPool::new(Counter::default, limits(30), 0);
        assert_eq!(pool.prefill(5), 5);

        let taken: Vec<_> = (0..10).map(|_| pool.pop().unwrap()).collect();
        assert_eq!(pool.created(), 10);
        assert_eq!(pool.idle_len(), 0);

        for handler in taken {
            assert!(pool.push(handler));
        }
        assert_eq!(pool.idle_len(), 10);

        let bounded = HandlerPool::new(Counter::default, limits(30), 3);
        assert_eq!(bounded.prefill(5), 3);
    }

    #[test]
    fn reset_before_reuse() {
        let pool = HandlerPool::new(Counter::default, limits(30), 1);
        let mut handler = pool.pop().unwrap();
        handler.protocol_mut().seen = 7;
        handler.rx.add(b"left over");

        pool.push(handler);
        let handler = pool.pop().unwrap();
        assert_eq!(handler.protocol().seen, 0);
        assert!(handler.rx.is_empty());
    }

    #[test]
    fn foreign_handler_rejected() {
        let one = HandlerPool::new(Counter::default, limits(30), 1);
        let two = HandlerPool::new(Counter::default, limits(30), 1);

        let handler = one.pop().unwrap();
        assert!(!two.push(handler));
        assert_eq!(two.idle_len(), 0);
        assert_eq!(one.active_len(), 1);
    }

    #[test]
    fn fresh_session_per_pop() {
        let pool = HandlerPool::new(Counter::default, limits(30), 1);

        let handler = pool.pop().unwrap();
        let first = handler.liveness().clone();
        first.close();
        pool.push(handler);

        let handler = pool.pop().unwrap();
        assert!(!handler.liveness().is_closed());
        assert_eq!(handler.liveness().deadline(), Some(Duration::from_secs(30)));
        assert_eq!(handler.liveness().id(), first.id());
    }

    #[test]
    fn lease_returns_on_drop() {
        let pool = HandlerPool::new(Counter::default, limits(30), 1);
        {
            let mut lease = pool.lease().unwrap();
            lease.protocol_mut().seen = 3;
            assert!(pool.lease().is_none());
            assert_eq!(pool.active_len(), 1);
        }

        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn forget_frees_slot() {
        let pool = HandlerPool::new(Counter::default, limits(30), 1);
        let lost = pool.pop().unwrap();
        assert!(pool.pop().is_none());

        assert!(pool.forget(lost.id()));
        assert!(!pool.forget(lost.id()));
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.active_len(), 0);

        let fresh = pool.pop().unwrap();
        assert_ne!(fresh.id(), lost.id());
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn lease_dropped_by_panic_is_forgotten() {
        let pool = HandlerPool::new(Counter::default, limits(30), 1);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut lease = Lease::adopt(&pool, pool.pop().unwrap());
            lease.protocol_mut().seen = 1;
            panic!("protocol contract broken");
        }));

        assert!(result.is_err());
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.idle_len(), 0);
        assert!(pool.lease().is_some());
    }

    #[test]
    fn stop_disposes() {
        let pool = HandlerPool::new(Counter::default, limits(30), 0);
        pool.prefill(2);
        let active = pool.pop().unwrap();

        pool.stop();
        assert!(pool.is_stopping());
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.created(), 1);
        assert!(pool.pop().is_none());

        let liveness = active.liveness().clone();
        assert_eq!(pool.close_active(), 1);
        assert!(liveness.is_closed());

        assert!(pool.push(active));
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_overdue() {
        let pool = HandlerPool::new(Counter::default, limits(2), 0);
        let slow = pool.pop().unwrap();
        let busy = pool.pop().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        busy.liveness().touch();
        assert_eq!(pool.sweep(), 0);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(pool.sweep(), 1);
        assert!(slow.liveness().is_closed());
        assert!(!busy.liveness().is_closed());

        // Already closed sessions are not signalled twice.
        assert_eq!(pool.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_task() {
        let pool = HandlerPool::new(Counter::default, limits(1), 0);
        pool.start(Duration::from_millis(100));

        let handler = pool.pop().unwrap();
        let liveness = handler.liveness().clone();

        let closed = tokio::time::timeout(Duration::from_secs(5), liveness.closed()).await;
        assert!(closed.is_ok());

        pool.push(handler);
        pool.stop();
    }
}
