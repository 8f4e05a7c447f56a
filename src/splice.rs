//! Outbound legs for proxies
//!
//! An inbound handler that wants to relay to an upstream calls
//! [`SplicePool::capture`]. The pool pops an [`OutboundLeg`], links it to the
//! caller through a [`Pairing`], connects it and starts it directly on the
//! relay stage. From then on both sides run [`relay_step`] as their
//! `AsyncAction` until one of them closes.

use crate::{
    limits::ConnLimits,
    queue::{ByteQueue, SharedQueue},
    server::{
        handler::{Action, Context, Link, Protocol},
        pool::{HandlerPool, Lease},
    },
    socket::{Connector, SocketIo},
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Bytes one side may have queued for the other, in socket buffer sizes,
/// before it stops reading from its own socket.
pub const RELAY_FACTOR: usize = 4;

/// Which end of a pairing a handler is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Inbound,
    Outbound,
}

impl Side {
    #[inline]
    fn other(self) -> Self {
        match self {
            Side::Inbound => Side::Outbound,
            Side::Outbound => Side::Inbound,
        }
    }
}

/// The link between an inbound handler and its outbound leg.
///
/// Each side owns one queue of bytes waiting to be written to its socket
/// and one wake signal.
pub struct Pairing {
    inbound_id: u64,
    target: String,
    to_inbound: SharedQueue,
    to_outbound: SharedQueue,
    inbound_wake: Notify,
    outbound_wake: Notify,
    closed: AtomicBool,
}

impl Pairing {
    pub fn new(inbound_id: u64, target: impl Into<String>) -> Self {
        Self {
            inbound_id,
            target: target.into(),
            to_inbound: ByteQueue::shared(),
            to_outbound: ByteQueue::shared(),
            inbound_wake: Notify::new(),
            outbound_wake: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn queue(&self, side: Side) -> &SharedQueue {
        match side {
            Side::Inbound => &self.to_inbound,
            Side::Outbound => &self.to_outbound,
        }
    }

    #[inline]
    fn wake(&self, side: Side) -> &Notify {
        match side {
            Side::Inbound => &self.inbound_wake,
            Side::Outbound => &self.outbound_wake,
        }
    }

    #[inline]
    pub fn inbound_id(&self) -> u64 {
        self.inbound_id
    }

    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Moves everything in `rx`, read by `from`, to the other side.
    pub fn forward(&self, from: Side, rx: &mut ByteQueue) -> usize {
        if rx.is_empty() {
            return 0;
        }

        let to = from.other();
        let moved = rx.move_to(&mut self.queue(to).lock(), None);
        self.wake(to).notify_waiters();
        moved
    }

    /// Moves the bytes waiting for `side` into its `tx`.
    ///
    /// The other side is woken, it may be held back by a full queue.
    pub fn collect(&self, side: Side, tx: &mut ByteQueue) -> usize {
        let moved = self.queue(side).lock().move_to(tx, None);
        if moved != 0 {
            self.wake(side.other()).notify_waiters();
        }
        moved
    }

    #[inline]
    pub fn pending(&self, side: Side) -> usize {
        self.queue(side).lock().len()
    }

    /// Resolves once bytes are waiting for `side` or the pairing is closed.
    pub async fn ready(&self, side: Side) {
        loop {
            let wake = self.wake(side).notified();
            if self.is_closed() || self.pending(side) != 0 {
                return;
            }
            wake.await;
        }
    }

    /// Resolves once the queue `side` fills for the other side holds less
    /// than `limit` bytes, bytes are waiting for `side`, or the pairing is
    /// closed.
    pub async fn drained(&self, side: Side, limit: usize) {
        loop {
            let wake = self.wake(side).notified();
            if self.is_closed() || self.pending(side) != 0 || self.pending(side.other()) < limit {
                return;
            }
            wake.await;
        }
    }

    /// Ends the relay for both sides. Bytes already forwarded are still
    /// delivered.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inbound_wake.notify_waiters();
            self.outbound_wake.notify_waiters();
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pairing")
            .field("inbound_id", &self.inbound_id)
            .field("target", &self.target)
            .field("to_inbound", &self.pending(Side::Inbound))
            .field("to_outbound", &self.pending(Side::Outbound))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One relay stage for `side`, run as its `AsyncAction`.
///
/// Bytes in rx go to the other side. Bytes waiting for this side are moved
/// to tx and flushed with `Send`. Otherwise the stage waits for either the
/// socket or the other side. The protocol's `send` hook should answer
/// `AsyncAction` to keep relaying.
///
/// A side stops reading while the other side has [`RELAY_FACTOR`] socket
/// buffers or more waiting, so a slow reader throttles a fast writer.
pub async fn relay_step<S: SocketIo>(pairing: &Pairing, side: Side, cx: &mut Context<'_, S>) -> Action {
    let limit = RELAY_FACTOR * cx.buffer_size().max(1);

    loop {
        pairing.forward(side, cx.rx());

        if pairing.collect(side, cx.tx()) != 0 {
            return Action::Send;
        }
        if pairing.is_closed() {
            return Action::Disconnect;
        }

        if pairing.pending(side.other()) >= limit {
            trace!(handler_id = cx.id(), ?side, "relay throttled");
            pairing.drained(side, limit).await;
            continue;
        }

        let received = tokio::select! {
            biased;
            _ = pairing.ready(side) => continue,
            received = cx.receive_some() => received,
        };

        match received {
            Ok(0) => {
                debug!(handler_id = cx.id(), ?side, "relay peer closed");
                pairing.close();
            }
            Ok(_) => {}
            Err(err) => {
                debug!(handler_id = cx.id(), ?side, error = %err, "relay receive failed");
                pairing.close();
            }
        }
    }
}

/// Closes the pairing when the outbound task ends, however it ends.
struct Closing(Arc<Pairing>);

impl std::ops::Deref for Closing {
    type Target = Pairing;

    fn deref(&self) -> &Pairing {
        &self.0
    }
}

impl Drop for Closing {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// The upstream side of a pairing.
#[derive(Debug, Default)]
pub struct OutboundLeg {
    pairing: Option<Arc<Pairing>>,
}

impl OutboundLeg {
    #[inline]
    pub fn pairing(&self) -> Option<&Arc<Pairing>> {
        self.pairing.as_ref()
    }
}

impl Protocol for OutboundLeg {
    fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        Action::AsyncAction
    }

    fn receive<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        Action::AsyncAction
    }

    fn send<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        Action::AsyncAction
    }

    async fn async_action<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        match self.pairing.clone() {
            Some(pairing) => relay_step(&pairing, Side::Outbound, cx).await,
            None => Action::Disconnect,
        }
    }

    fn reset(&mut self) {
        if let Some(pairing) = self.pairing.take() {
            pairing.close();
        }
    }
}

/// A [`HandlerPool`] of outbound legs plus the connector that opens them.
pub struct SplicePool<C: Connector> {
    legs: Arc<HandlerPool<OutboundLeg>>,
    connector: Arc<C>,
}

impl<C: Connector> SplicePool<C> {
    /// `capacity` bounds the outbound legs alive at once (`0` is unlimited).
    pub fn new(connector: C, limits: ConnLimits, capacity: usize) -> Self {
        Self {
            legs: HandlerPool::new(OutboundLeg::default, limits, capacity),
            connector: Arc::new(connector),
        }
    }

    /// Opens an outbound leg to `target` for the inbound handler `inbound_id`.
    ///
    /// Returns `None` without side effects when no leg can be spared or the
    /// pool is stopping; the caller then serves the connection itself. The
    /// connection attempt runs in the background, and a failed attempt
    /// closes the returned pairing.
    pub fn capture(&self, inbound_id: u64, target: &str) -> Option<Arc<Pairing>> {
        if self.legs.is_stopping() {
            return None;
        }

        let Some(mut leg) = self.legs.pop() else {
            debug!(inbound_id, upstream = target, "no outbound leg available");
            return None;
        };

        let pairing = Arc::new(Pairing::new(inbound_id, target));
        leg.protocol_mut().pairing = Some(pairing.clone());
        debug!(inbound_id, leg_id = leg.id(), upstream = target, "outbound leg captured");

        let legs = self.legs.clone();
        let connector = self.connector.clone();
        let linked = pairing.clone();

        tokio::spawn(async move {
            let linked = Closing(linked);
            let mut leg = Lease::adopt(&legs, leg);

            match connector.connect(linked.target()).await {
                Ok(mut socket) => {
                    let limits = legs.limits().clone();
                    if let Err(err) = socket.configure(&limits) {
                        debug!(leg_id = leg.id(), "socket options not applied: {err}");
                    }

                    let mut link = Link::new(0, socket.peer_addr(), limits);
                    if let Err(err) = leg.resume(&mut socket, &mut link, Action::AsyncAction).await {
                        debug!(leg_id = leg.id(), error = %err, "outbound leg failed");
                    }
                    socket.close();
                }
                Err(err) => warn!(upstream = linked.target(), "outbound connect failed: {err}"),
            }
        });

        Some(pairing)
    }

    /// Starts the periodic sweep of overdue legs.
    pub fn start(&self, interval: Duration) {
        self.legs.start(interval);
    }

    /// Refuses further captures and disposes idle legs. Running relays are
    /// closed too.
    pub fn stop(&self) -> usize {
        self.legs.stop();
        self.legs.close_active()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.legs.ceiling()
    }

    #[inline]
    pub fn legs(&self) -> &Arc<HandlerPool<OutboundLeg>> {
        &self.legs
    }

    #[inline]
    pub fn connector(&self) -> &C {
        &self.connector
    }
}

impl<C: Connector> fmt::Debug for SplicePool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplicePool")
            .field("legs", &self.legs)
            .finish_non_exhaustive()
    }
}
