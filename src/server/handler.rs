use crate::{
    errors::{Error, Result},
    limits::{ConnLimits, TlsPolicy},
    queue::ByteQueue,
    server::pool::HandlerPool,
    socket::SocketIo,
    tls::session::TlsSession,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace};

/// The next step a protocol asks the engine to perform.
///
/// Returned by every [`Protocol`] hook. The engine executes exactly one
/// action at a time and calls back into the protocol when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read up to `n` bytes into the rx queue, then call [`Protocol::receive`].
    ///
    /// `0` reads up to the configured socket buffer size. A read that returns
    /// no bytes means the peer closed, and the engine disconnects.
    Receive(usize),
    /// Flush the whole tx queue, then call [`Protocol::send`].
    Send,
    /// Await [`Protocol::async_action`] and use the action it returns.
    AsyncAction,
    /// Hand the connection back to the handler that delegated it.
    ///
    /// Only valid inside [`Context::delegate`]; requesting it from a
    /// top-level handler panics.
    ReleaseControl,
    /// Shut the write side down, close the socket and end the run.
    Disconnect,
    /// End the run without touching the socket.
    Dispose,
}

/// How a handler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The delegate returned control with [`Action::ReleaseControl`].
    Released,
    /// The socket was shut down and closed.
    Closed,
    /// The protocol asked to be disposed.
    Disposed,
}

/// A per-connection protocol plugged into the engine.
///
/// Hooks never perform I/O on their own: they inspect and fill the queues
/// exposed by the [`Context`] and return the next [`Action`]. Only
/// `async_action` may await.
///
/// # Examples
///
/// A line echo server:
/// ```
/// use connpool::{Action, Context, Protocol, SocketIo};
///
/// #[derive(Default)]
/// struct LineEcho {
///     lines: usize,
/// }
///
/// impl Protocol for LineEcho {
///     fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
///         Action::Receive(0)
///     }
///
///     fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
///         let (rx, tx) = cx.queues();
///         while let Some(end) = rx.index_of(b'\n') {
///             rx.move_to(tx, Some(end + 1));
///             self.lines += 1;
///         }
///
///         match cx.tx().is_empty() {
///             true => Action::Receive(0),
///             false => Action::Send,
///         }
///     }
///
///     fn reset(&mut self) {
///         self.lines = 0;
///     }
/// }
/// ```
pub trait Protocol: Send + 'static {
    /// Called once when the handler takes over a connection.
    ///
    /// The rx queue may already hold bytes, e.g. those read while sniffing
    /// for TLS or left over by an outer handler.
    fn initialize<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action;

    /// Called after a `Receive` stage added bytes to the rx queue.
    fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action;

    /// Called after a `Send` stage drained the tx queue.
    fn send<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        let _ = cx;
        Action::Receive(0)
    }

    /// A longer asynchronous step (file read, lookup, relaying...).
    fn async_action<S: SocketIo>(
        &mut self,
        cx: &mut Context<'_, S>,
    ) -> impl Future<Output = Action> + Send {
        let _ = cx;
        async { Action::Disconnect }
    }

    /// Restores the protocol to its initial state before the handler
    /// goes back to its pool.
    fn reset(&mut self) {}
}

//

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Timers and the close signal of one handler session.
///
/// Shared between the running engine and the pool's active-set so that the
/// maintenance sweep can observe deadlines and force-close the session
/// without touching the handler itself.
#[derive(Debug)]
pub struct Liveness {
    id: u64,
    epoch: Instant,
    last_activity: AtomicU64,
    deadline: AtomicU64,
    closed: AtomicBool,
    close: Notify,
    fault: Mutex<Option<String>>,
}

const NO_DEADLINE: u64 = u64::MAX;

impl Liveness {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            deadline: AtomicU64::new(NO_DEADLINE),
            closed: AtomicBool::new(false),
            close: Notify::new(),
            fault: Mutex::new(None),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Records activity on the connection.
    #[inline]
    pub fn touch(&self) {
        self.last_activity.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Arms the deadline of the current stage.
    pub fn arm(&self, timeout: Duration, reset_activity: bool) {
        if reset_activity {
            self.touch();
        }
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(NO_DEADLINE - 1);
        self.deadline.store(ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn disarm(&self) {
        self.deadline.store(NO_DEADLINE, Ordering::Relaxed);
    }

    /// The armed stage deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        match self.deadline.load(Ordering::Relaxed) {
            NO_DEADLINE => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// `true` once the time since the last activity exceeds the armed deadline.
    pub fn is_overdue(&self) -> bool {
        match self.deadline() {
            Some(deadline) => self.idle() > deadline,
            None => false,
        }
    }

    /// Forces the session closed. Any stage in flight is abandoned and the
    /// run ends with [`Error::Expired`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close.notify_waiters();
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.close.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// The last fault that ended a run of this session.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub(crate) fn record_fault(&self, err: &Error) {
        *self.fault.lock() = Some(err.to_string());
    }
}

//

/// Per-connection transport state shared by every handler that drives the
/// connection (the accepting handler and any delegates).
#[derive(Debug)]
pub struct Link {
    local_port: u16,
    peer: Option<SocketAddr>,
    limits: ConnLimits,
    policy: TlsPolicy,
    pub(crate) tls: Option<TlsSession>,
    depth: usize,
    timeout: Option<(Duration, bool)>,
    scratch: Vec<u8>,
}

impl Link {
    pub fn new(local_port: u16, peer: Option<SocketAddr>, limits: ConnLimits) -> Self {
        Self {
            local_port,
            peer,
            limits,
            policy: TlsPolicy::Disabled,
            tls: None,
            depth: 0,
            timeout: None,
            scratch: Vec::new(),
        }
    }

    /// Negotiate TLS per `policy` before the protocol starts.
    pub fn with_tls(mut self, policy: TlsPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// The view of a connection a [`Protocol`] hook works with.
pub struct Context<'a, S: SocketIo> {
    socket: &'a mut S,
    rx: &'a mut ByteQueue,
    tx: &'a mut ByteQueue,
    liveness: &'a Arc<Liveness>,
    link: &'a mut Link,
}

impl<'a, S: SocketIo> Context<'a, S> {
    #[inline(always)]
    pub fn rx(&mut self) -> &mut ByteQueue {
        &mut *self.rx
    }

    #[inline(always)]
    pub fn tx(&mut self) -> &mut ByteQueue {
        &mut *self.tx
    }

    /// Both queues at once, e.g. to move bytes from rx to tx.
    #[inline(always)]
    pub fn queues(&mut self) -> (&mut ByteQueue, &mut ByteQueue) {
        (&mut *self.rx, &mut *self.tx)
    }

    #[inline(always)]
    pub fn socket(&mut self) -> &mut S {
        &mut *self.socket
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.liveness.id()
    }

    #[inline(always)]
    pub fn liveness(&self) -> &Arc<Liveness> {
        self.liveness
    }

    #[inline]
    pub fn local_port(&self) -> u16 {
        self.link.local_port
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.link.tls.is_some()
    }

    #[inline]
    pub fn limits(&self) -> &ConnLimits {
        &self.link.limits
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.link.limits.socket_buffer_size
    }

    /// `true` while running as a delegate inside [`delegate`](Self::delegate).
    #[inline]
    pub fn is_delegated(&self) -> bool {
        self.link.depth > 0
    }

    /// Overrides the default deadline of the next stage.
    ///
    /// With `reset_activity` the idle clock restarts when the stage begins,
    /// otherwise the deadline also covers the time already spent idle.
    #[inline]
    pub fn set_timeout(&mut self, timeout: Duration, reset_activity: bool) {
        self.link.timeout = Some((timeout, reset_activity));
    }

    #[inline]
    pub fn touch(&self) {
        self.liveness.touch();
    }

    /// Reads whatever is available (up to the socket buffer size) into rx.
    pub async fn receive_some(&mut self) -> Result<usize> {
        self.receive_up_to(0).await
    }

    pub(crate) async fn receive_up_to(&mut self, max: usize) -> Result<usize> {
        let n = match self.link.tls.as_mut() {
            Some(tls) => tls.receive_into(&mut *self.socket, &mut *self.rx).await?,
            None => {
                let max = match max {
                    0 => self.link.limits.socket_buffer_size.max(1),
                    max => max,
                };
                if self.link.scratch.len() < max {
                    self.link.scratch.resize(max, 0);
                }

                let buf = &mut self.link.scratch[..max];
                let n = self.socket.receive(buf).await?;
                self.rx.add(&buf[..n]);
                n
            }
        };

        if n != 0 {
            self.liveness.touch();
        }
        Ok(n)
    }

    /// Writes the whole tx queue, looping on partial sends.
    pub async fn flush(&mut self) -> Result<usize> {
        let total = self.tx.len();

        match self.link.tls.as_mut() {
            Some(tls) => tls.send_from(&mut *self.socket, &mut *self.tx).await?,
            None => {
                while !self.tx.is_empty() {
                    let n = self.socket.send(self.tx.as_slice()).await?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }

                    self.tx.remove(n);
                    self.liveness.touch();
                }
            }
        }

        Ok(total)
    }

    /// Negotiates TLS as the server side of the connection.
    ///
    /// Bytes already in rx (e.g. read while sniffing) are fed to the TLS
    /// engine first.
    pub async fn start_tls_server(&mut self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        let session = TlsSession::server(config)?;
        self.start_tls(session).await
    }

    /// Negotiates TLS as the client side of the connection.
    pub async fn start_tls_client(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<()> {
        let session = TlsSession::client(config, server_name)?;
        self.start_tls(session).await
    }

    async fn start_tls(&mut self, mut session: TlsSession) -> Result<()> {
        let pending = self.rx.remove_all();
        session.adapter().stage(&pending);

        session.handshake(&mut *self.socket).await?;
        self.liveness.touch();
        self.link.tls = Some(session);
        Ok(())
    }

    /// Leaves TLS. Undelivered plaintext and staged bytes move into rx.
    pub fn stop_tls(&mut self) -> bool {
        match self.link.tls.take() {
            Some(session) => {
                session.teardown(self.rx);
                true
            }
            None => false,
        }
    }

    /// Temporarily hands the connection to a handler from `pool`.
    ///
    /// Unread rx bytes move into the delegate, the delegate runs over the
    /// same socket until it ends its run, then its unread rx bytes move back
    /// and it returns to `pool`. [`Outcome::Released`] means this handler
    /// owns the connection again; any other outcome means the delegate ended
    /// the connection.
    ///
    /// Fails with [`Error::PoolExhausted`] when `pool` has no handler to spare.
    pub async fn delegate<Q, F>(&mut self, pool: &HandlerPool<Q>, prepare: F) -> Result<Outcome>
    where
        Q: Protocol,
        F: FnOnce(&mut Q) + Send,
    {
        let mut lease = pool.lease().ok_or(Error::PoolExhausted)?;
        prepare(lease.protocol_mut());
        self.rx.move_to(&mut lease.rx, None);

        self.link.depth += 1;
        let result = {
            let run: Pin<Box<dyn Future<Output = Result<Outcome>> + Send + '_>> =
                Box::pin(lease.drive(&mut *self.socket, &mut *self.link, None));
            run.await
        };
        self.link.depth -= 1;

        lease.rx.move_to(self.rx, None);
        self.liveness.touch();
        result
    }

    fn arm_stage(&mut self, action: &Action) {
        match self.link.timeout.take() {
            Some((timeout, reset)) => self.liveness.arm(timeout, reset),
            None => match self.link.limits.stage_timeout(action) {
                Some(timeout) => self.liveness.arm(timeout, true),
                None => self.liveness.disarm(),
            },
        }
    }
}

//

/// A pooled protocol instance with its own rx/tx queues.
pub struct Handler<P: Protocol> {
    protocol: P,
    pub(crate) rx: ByteQueue,
    pub(crate) tx: ByteQueue,
    liveness: Arc<Liveness>,
}

impl<P: Protocol> Handler<P> {
    pub(crate) fn new(protocol: P) -> Self {
        Self {
            protocol,
            rx: ByteQueue::new(),
            tx: ByteQueue::new(),
            liveness: Liveness::new(next_id()),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.liveness.id()
    }

    #[inline(always)]
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    #[inline(always)]
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    #[inline(always)]
    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// Starts a new session: fresh timers and close signal, same identity.
    pub(crate) fn renew(&mut self) {
        self.liveness = Liveness::new(self.liveness.id());
        self.liveness.touch();
    }

    pub(crate) fn reset(&mut self) {
        self.rx.clear();
        self.tx.clear();
        self.liveness.disarm();
        self.protocol.reset();
    }

    /// Drives the protocol over `socket` from `initialize` until the run ends.
    ///
    /// When `link` carries a TLS policy, TLS is negotiated first.
    pub async fn run<S: SocketIo>(&mut self, socket: &mut S, link: &mut Link) -> Result<Outcome> {
        if link.depth == 0 && link.tls.is_none() && link.policy.config().is_some() {
            let live = self.liveness.clone();
            let negotiated = tokio::select! {
                biased;
                _ = live.closed() => Err(Error::Expired),
                result = self.negotiate_tls(socket, link) => result,
            };

            match negotiated {
                Ok(true) => {}
                Ok(false) => {
                    socket.close();
                    return Ok(Outcome::Closed);
                }
                Err(err) => {
                    self.liveness.record_fault(&err);
                    socket.close();
                    return Err(err);
                }
            }
        }

        self.drive(socket, link, None).await
    }

    /// Drives the protocol starting with `action` instead of `initialize`.
    pub async fn resume<S: SocketIo>(
        &mut self,
        socket: &mut S,
        link: &mut Link,
        action: Action,
    ) -> Result<Outcome> {
        self.drive(socket, link, Some(action)).await
    }

    /// Returns `false` when the peer closed before sending anything.
    async fn negotiate_tls<S: SocketIo>(&mut self, socket: &mut S, link: &mut Link) -> Result<bool> {
        let policy = link.policy.clone();
        let mut cx = Context {
            socket,
            rx: &mut self.rx,
            tx: &mut self.tx,
            liveness: &self.liveness,
            link,
        };

        let config = match policy {
            TlsPolicy::Disabled => return Ok(true),
            TlsPolicy::Required(config) => config,
            TlsPolicy::Optional(config) => {
                if cx.rx.is_empty() && cx.receive_up_to(0).await? == 0 {
                    return Ok(false);
                }
                if cx.rx.peek(0) != Some(0x16) {
                    trace!(handler_id = cx.id(), "plain connection on tls-optional port");
                    return Ok(true);
                }
                config
            }
        };

        cx.start_tls_server(config).await?;
        debug!(handler_id = cx.id(), "tls negotiated");
        Ok(true)
    }

    pub(crate) async fn drive<S: SocketIo>(
        &mut self,
        socket: &mut S,
        link: &mut Link,
        first: Option<Action>,
    ) -> Result<Outcome> {
        let id = self.id();
        let result = self.drive_stages(socket, link, first).await;

        match &result {
            Ok(outcome) => debug!(handler_id = id, ?outcome, "handler run finished"),
            Err(err) => {
                debug!(handler_id = id, error = %err, "handler run failed");
                self.liveness.record_fault(err);
                socket.close();
            }
        }
        result
    }

    async fn drive_stages<S: SocketIo>(
        &mut self,
        socket: &mut S,
        link: &mut Link,
        first: Option<Action>,
    ) -> Result<Outcome> {
        let Handler {
            protocol,
            rx,
            tx,
            liveness,
        } = self;
        let live = liveness.clone();

        let mut cx = Context {
            socket,
            rx,
            tx,
            liveness,
            link,
        };

        let mut action = match first {
            Some(action) => action,
            None => protocol.initialize(&mut cx),
        };

        loop {
            trace!(handler_id = live.id(), ?action, "stage");
            if live.is_closed() {
                return Err(Error::Expired);
            }
            cx.arm_stage(&action);

            action = match action {
                Action::Receive(max) => {
                    let received = tokio::select! {
                        biased;
                        _ = live.closed() => return Err(Error::Expired),
                        received = cx.receive_up_to(max) => received?,
                    };

                    match received {
                        0 => Action::Disconnect,
                        _ => protocol.receive(&mut cx),
                    }
                }
                Action::Send => {
                    tokio::select! {
                        biased;
                        _ = live.closed() => return Err(Error::Expired),
                        flushed = cx.flush() => flushed?,
                    };
                    protocol.send(&mut cx)
                }
                Action::AsyncAction => {
                    tokio::select! {
                        biased;
                        _ = live.closed() => return Err(Error::Expired),
                        next = protocol.async_action(&mut cx) => next,
                    }
                }
                Action::ReleaseControl => {
                    assert!(
                        cx.link.depth > 0,
                        "ReleaseControl requested by a handler that was not delegated"
                    );
                    return Ok(Outcome::Released);
                }
                Action::Disconnect => {
                    let _ = cx.socket.shutdown().await;
                    cx.socket.close();
                    return Ok(Outcome::Closed);
                }
                Action::Dispose => return Ok(Outcome::Disposed),
            };
        }
    }
}

#[cfg(test)]
mod handler_tests {
    use super::*;
    use crate::{socket::SimSocket, tools::sim_link};
    use std::sync::Arc;

    #[derive(Default)]
    struct Echo;

    impl Protocol for Echo {
        fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::Receive(0)
        }

        fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
            let (rx, tx) = cx.queues();
            rx.move_to(tx, None);
            Action::Send
        }
    }

    // Upper-cases one line, then hands control back.
    #[derive(Default)]
    struct Shout {
        marker: u8,
    }

    impl Protocol for Shout {
        fn initialize<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
            assert!(cx.is_delegated());
            let Some(end) = cx.rx().index_of(b'\n') else {
                return Action::Receive(0);
            };

            let line = cx.rx().remove_exact(end + 1).unwrap();
            let tx = cx.tx();
            tx.add(&[self.marker]);
            tx.add(&line.to_ascii_uppercase());
            Action::Send
        }

        fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
            self.initialize(cx)
        }

        fn send<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::ReleaseControl
        }

        fn reset(&mut self) {
            self.marker = 0;
        }
    }

    struct Outer {
        shouters: Arc<HandlerPool<Shout>>,
        released: usize,
    }

    impl Protocol for Outer {
        fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::Receive(0)
        }

        fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
            match cx.rx().peek(0) {
                Some(b'!') => {
                    cx.rx().remove(1);
                    Action::AsyncAction
                }
                Some(_) => {
                    let (rx, tx) = cx.queues();
                    rx.move_to(tx, None);
                    Action::Send
                }
                None => Action::Receive(0),
            }
        }

        async fn async_action<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
            match cx.delegate(&self.shouters, |shout| shout.marker = b'>').await {
                Ok(Outcome::Released) => {
                    self.released += 1;
                    match cx.rx().is_empty() {
                        true => Action::Receive(0),
                        false => self.receive(cx),
                    }
                }
                _ => Action::Dispose,
            }
        }

        fn reset(&mut self) {
            self.released = 0;
        }
    }

    struct Releaser;

    impl Protocol for Releaser {
        fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::ReleaseControl
        }

        fn receive<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::Disconnect
        }
    }

    struct Patient;

    impl Protocol for Patient {
        fn initialize<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
            cx.set_timeout(Duration::from_secs(5), true);
            Action::Receive(0)
        }

        fn receive<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
            Action::Receive(0)
        }
    }

    async fn read_exact(socket: &mut SimSocket, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while out.len() < len {
            let n = socket.receive(&mut buf).await.unwrap();
            assert_ne!(n, 0, "peer closed early");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn echo_until_peer_closes() {
        let (mut client, mut server) = SimSocket::pair(1024);
        let mut handler = Handler::new(Echo);

        let run = tokio::spawn(async move {
            let mut link = sim_link();
            let outcome = handler.run(&mut server, &mut link).await;
            (outcome, server)
        });

        client.send_all(b"ping").await.unwrap();
        assert_eq!(read_exact(&mut client, 4).await, b"ping");
        client.send_all(b"pong").await.unwrap();
        assert_eq!(read_exact(&mut client, 4).await, b"pong");

        client.shutdown().await.unwrap();
        let (outcome, server) = run.await.unwrap();
        assert_eq!(outcome.unwrap(), Outcome::Closed);
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn delegate_and_resume() {
        let shouters = HandlerPool::new(Shout::default, ConnLimits::default(), 1);
        let (mut client, mut server) = SimSocket::pair(1024);
        let mut handler = Handler::new(Outer {
            shouters: shouters.clone(),
            released: 0,
        });

        client.send_all(b"!ab\ncd").await.unwrap();

        let run = tokio::spawn(async move {
            let mut link = sim_link();
            let outcome = handler.run(&mut server, &mut link).await;
            (outcome, handler)
        });

        assert_eq!(read_exact(&mut client, 6).await, b">AB\ncd");

        client.close();
        let (outcome, handler) = run.await.unwrap();
        assert_eq!(outcome.unwrap(), Outcome::Closed);
        assert_eq!(handler.protocol().released, 1);

        assert_eq!(shouters.active_len(), 0);
        assert_eq!(shouters.idle_len(), 1);
    }

    #[tokio::test]
    async fn delegate_without_spare_handler() {
        let shouters = HandlerPool::new(Shout::default, ConnLimits::default(), 1);
        let _busy = shouters.pop().unwrap();

        let (mut client, mut server) = SimSocket::pair(1024);
        let mut handler = Handler::new(Outer {
            shouters: shouters.clone(),
            released: 0,
        });

        client.send_all(b"!x\n").await.unwrap();
        let mut link = sim_link();
        let outcome = handler.run(&mut server, &mut link).await.unwrap();

        assert_eq!(outcome, Outcome::Disposed);
        assert_eq!(handler.rx.as_slice(), b"x\n");
    }

    #[tokio::test]
    #[should_panic(expected = "ReleaseControl requested by a handler that was not delegated")]
    async fn release_without_outer_handler() {
        let (_client, mut server) = SimSocket::pair(64);
        let mut handler = Handler::new(Releaser);

        let _ = handler.run(&mut server, &mut sim_link()).await;
    }

    #[tokio::test]
    async fn forced_close_unblocks_receive() {
        let (mut client, mut server) = SimSocket::pair(64);
        let mut handler = Handler::new(Echo);
        let liveness = handler.liveness().clone();

        let run = tokio::spawn(async move {
            let outcome = handler.run(&mut server, &mut sim_link()).await;
            (outcome, handler)
        });

        tokio::task::yield_now().await;
        liveness.close();

        let (outcome, handler) = run.await.unwrap();
        assert!(matches!(outcome, Err(Error::Expired)));
        assert_eq!(handler.liveness().fault().as_deref(), Some("connection expired"));

        let mut buf = [0u8; 4];
        assert_eq!(client.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stage_timeouts() {
        let (client, mut server) = SimSocket::pair(64);
        let mut handler = Handler::new(Patient);
        let liveness = handler.liveness().clone();

        let run = tokio::spawn(async move {
            let _ = handler.run(&mut server, &mut sim_link()).await;
        });

        tokio::task::yield_now().await;
        assert_eq!(liveness.deadline(), Some(Duration::from_secs(5)));
        assert!(!liveness.is_overdue());

        drop(client);
        liveness.close();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_overdue() {
        let liveness = Liveness::new(next_id());
        liveness.arm(Duration::from_secs(2), true);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!liveness.is_overdue());
        liveness.touch();

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert!(liveness.is_overdue());

        liveness.disarm();
        assert!(!liveness.is_overdue());
    }
}
