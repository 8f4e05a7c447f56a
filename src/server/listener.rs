use super::{
    accept::{AcceptPool, AcceptStats},
    handler::{Handler, Link, Protocol},
    pool::{HandlerPool, Lease},
};
use crate::{
    errors::{Error, Result},
    limits::{ConnLimits, ServerLimits, TlsPolicy},
    socket::{SocketIo, TcpSocket},
};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Accepts connections on a set of ports and runs a pooled [`Protocol`]
/// handler for each of them.
///
/// All ports share one [`HandlerPool`] and one connection ceiling. Ports
/// can be added and removed while the listener runs, see
/// [`reconfigure`](Self::reconfigure).
pub struct Listener<P: Protocol> {
    shared: Arc<Shared<P>>,
}

struct Shared<P: Protocol> {
    pool: Arc<HandlerPool<P>>,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    tls: TlsPolicy,

    permits: Arc<Semaphore>,
    accepts: AcceptPool,
    endpoints: Mutex<Endpoints>,

    running: AtomicBool,
    live: AtomicUsize,
    drained: Notify,
}

#[derive(Default)]
struct Endpoints {
    desired: Vec<u16>,
    bound: BTreeMap<u16, Endpoint>,
}

struct Endpoint {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// What a call to [`Listener::reconfigure`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconfigured {
    pub closed: Vec<u16>,
    pub opened: Vec<u16>,
    /// Ports that could not be bound. The other ports are unaffected.
    pub failed: Vec<u16>,
}

/// Splits the change from `current` to `desired` into ports to close and
/// ports to open. Order follows the inputs and duplicates are ignored.
pub fn plan_ports(current: &[u16], desired: &[u16]) -> (Vec<u16>, Vec<u16>) {
    let mut remove = Vec::new();
    for port in current {
        if !desired.contains(port) && !remove.contains(port) {
            remove.push(*port);
        }
    }

    let mut add = Vec::new();
    for port in desired {
        if !current.contains(port) && !add.contains(port) {
            add.push(*port);
        }
    }

    (remove, add)
}

impl<P: Protocol> Listener<P> {
    /// Creates a new builder for configuring the listener.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # connpool::impl_echo_protocol!{ Echo }
    /// # #[tokio::main]
    /// # async fn main() -> connpool::Result<()> {
    /// use connpool::Listener;
    ///
    /// let listener = Listener::builder()
    ///     .ports([8080])
    ///     .factory(|| Echo)
    ///     .build();
    ///
    /// listener.start()?;
    /// # Ok(())
    /// # }
    /// ```
    #[inline]
    pub fn builder() -> ListenerBuilder<P> {
        ListenerBuilder {
            ports: Vec::new(),
            factory: None,
            pool: None,
            server_limits: None,
            connection_limits: None,
            tls: TlsPolicy::Disabled,
        }
    }

    /// Binds every configured port and starts the pool's maintenance sweep.
    ///
    /// A listener is single-use: once [`stop`](Self::stop) has stopped its
    /// handler pool, `start` fails with [`Error::ShuttingDown`]. Calling it
    /// on a running listener changes nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<Reconfigured> {
        let shared = &self.shared;
        if shared.pool.is_stopping() {
            return Err(Error::ShuttingDown);
        }
        if shared.running.swap(true, Ordering::AcqRel) {
            return Ok(Reconfigured::default());
        }

        shared.pool.start(shared.server_limits.maintenance_interval);
        let ports = shared.endpoints.lock().desired.clone();
        let result = self.reconfigure(&ports);

        info!(ports = ?self.ports(), "listener started");
        Ok(result)
    }

    /// Moves the listener to exactly the `desired` set of ports.
    ///
    /// Ports no longer wanted stop accepting and their sockets close. New
    /// ports are bound and start accepting. Ports in both sets are left
    /// untouched, including their in-flight accepts. Before
    /// [`start`](Self::start) this only records the desired set.
    pub fn reconfigure(&self, desired: &[u16]) -> Reconfigured {
        let shared = &self.shared;
        let mut endpoints = shared.endpoints.lock();
        endpoints.desired = desired.to_vec();

        let mut result = Reconfigured::default();
        if !shared.running.load(Ordering::Acquire) {
            return result;
        }

        let current: Vec<u16> = endpoints.bound.keys().copied().collect();
        let (remove, add) = plan_ports(&current, desired);

        for port in remove {
            if let Some(endpoint) = endpoints.bound.remove(&port) {
                endpoint.task.abort();
                info!(port, "stopped listening");
                result.closed.push(port);
            }
        }

        for port in add {
            let addr = SocketAddr::new(shared.server_limits.bind_addr, port);
            match bind(addr, shared.server_limits.backlog) {
                Ok(listener) => {
                    let local_addr = listener.local_addr().unwrap_or(addr);
                    let task = tokio::spawn(accept_loop(shared.clone(), port, listener));

                    info!(port, %local_addr, "listening");
                    endpoints.bound.insert(port, Endpoint { local_addr, task });
                    result.opened.push(port);
                }
                Err(err) => {
                    warn!(port, error = %err, "failed to bind port");
                    result.failed.push(port);
                }
            }
        }

        result
    }

    /// Stops accepting, stops the handler pool and waits up to
    /// `shutdown_grace` for live connections to finish.
    ///
    /// Returns `true` when every connection finished in time. Connections
    /// still running after the grace period are force-closed.
    pub async fn stop(&self) -> bool {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return shared.live.load(Ordering::Acquire) == 0;
        }

        let endpoints: Vec<(u16, Endpoint)> = std::mem::take(&mut shared.endpoints.lock().bound)
            .into_iter()
            .collect();
        for (port, endpoint) in endpoints {
            endpoint.task.abort();
            debug!(port, "stopped listening");
        }
        shared.pool.stop();

        let grace = shared.server_limits.shutdown_grace;
        let drained = tokio::time::timeout(grace, shared.wait_drained()).await.is_ok();

        if drained {
            info!("listener stopped");
        } else {
            let closed = shared.pool.close_active();
            warn!(
                live = shared.live.load(Ordering::Acquire),
                closed, "shutdown grace elapsed, closing remaining connections"
            );
        }
        drained
    }

    /// Ports currently bound and accepting.
    pub fn ports(&self) -> Vec<u16> {
        self.shared.endpoints.lock().bound.keys().copied().collect()
    }

    /// The bound address of a configured port (useful with port `0`).
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        let endpoints = self.shared.endpoints.lock();
        endpoints.bound.get(&port).map(|endpoint| endpoint.local_addr)
    }

    #[inline]
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn accept_stats(&self) -> AcceptStats {
        self.shared.accepts.stats()
    }

    #[inline]
    pub fn pool(&self) -> &Arc<HandlerPool<P>> {
        &self.shared.pool
    }
}

fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

async fn accept_loop<P: Protocol>(shared: Arc<Shared<P>>, port: u16, listener: TcpListener) {
    loop {
        let Ok(permit) = shared.permits.clone().acquire_owned().await else {
            break;
        };

        let mut descriptor = shared.accepts.take(port);
        match listener.accept().await {
            Ok((stream, peer)) => {
                descriptor.record_accept(peer);
                shared.dispatch(port, stream, peer, permit);
            }
            Err(err) => {
                descriptor.record_failure(&err);
                warn!(port, error = %err, "accept failed");
                drop(permit);
            }
        }

        shared.accepts.give(descriptor);
    }
}

impl<P: Protocol> Shared<P> {
    fn dispatch(self: &Arc<Self>, port: u16, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let Some(handler) = self.pool.pop() else {
            debug!(port, %peer, "no handler available, closing connection");
            return;
        };

        let mut socket = TcpSocket::new(stream);
        if let Err(err) = socket.configure(&self.conn_limits) {
            debug!(port, %peer, error = %err, "failed to apply socket options");
        }

        self.live.fetch_add(1, Ordering::AcqRel);
        let slot = Slot {
            shared: self.clone(),
            _permit: permit,
        };
        tokio::spawn(work(slot, handler, socket, port, peer));
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.live.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One live connection. The live count is decremented before the permit
/// is released.
///
/// The worker returns its handler before dropping the slot, so the live
/// count only reaches zero once every handler is back in the pool and a
/// drained [`Listener::stop`] never observes an active handler.
struct Slot<P: Protocol> {
    shared: Arc<Shared<P>>,
    _permit: OwnedSemaphorePermit,
}

impl<P: Protocol> Drop for Slot<P> {
    fn drop(&mut self) {
        if self.shared.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

async fn work<P: Protocol>(
    slot: Slot<P>,
    handler: Handler<P>,
    mut socket: TcpSocket,
    port: u16,
    peer: SocketAddr,
) {
    let shared = &slot.shared;
    let mut handler = Lease::adopt(&shared.pool, handler);
    let mut link = Link::new(port, Some(peer), shared.conn_limits.clone()).with_tls(shared.tls.clone());
    let id = handler.id();

    match handler.run(&mut socket, &mut link).await {
        Ok(outcome) => debug!(handler_id = id, %peer, ?outcome, "connection finished"),
        Err(err) if err.is_disconnect() => debug!(handler_id = id, %peer, error = %err, "connection dropped"),
        Err(err) => warn!(
            handler_id = id,
            %peer,
            error = %err,
            kind = ?err.io_kind(),
            "connection failed"
        ),
    }

    socket.close();
    drop(handler);
    drop(slot);
}

//

/// Builder for configuring and creating [`Listener`] instances.
pub struct ListenerBuilder<P: Protocol> {
    ports: Vec<u16>,
    factory: Option<Box<dyn Fn() -> P + Send + Sync>>,
    pool: Option<Arc<HandlerPool<P>>>,
    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    tls: TlsPolicy,
}

impl<P: Protocol> ListenerBuilder<P> {
    /// Sets the ports to listen on.
    #[inline(always)]
    pub fn ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    /// Builds handler instances on demand. The pool ceiling is
    /// [`ServerLimits::max_connections`].
    #[inline(always)]
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Uses an existing pool instead of a factory.
    #[inline(always)]
    pub fn pool(mut self, pool: Arc<HandlerPool<P>>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the server limits.
    ///
    /// See [`ServerLimits`] for the available options and defaults.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Sets the connection limits.
    ///
    /// See [`ConnLimits`] for the available options and defaults.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Negotiates TLS on accepted connections, see [`TlsPolicy`].
    #[inline(always)]
    pub fn tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = policy;
        self
    }

    /// Finalizes the builder and creates the [`Listener`].
    ///
    /// # Panics
    ///
    /// Panics with ``The `factory` or `pool` method must be called to create``
    /// when neither was called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Listener<P> {
        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();

        let pool = match (self.pool, self.factory) {
            (Some(pool), _) => pool,
            (None, Some(factory)) => {
                HandlerPool::new(factory, conn_limits.clone(), server_limits.max_connections)
            }
            (None, None) => panic!("The `factory` or `pool` method must be called to create"),
        };

        let permits = match server_limits.max_connections {
            0 => Semaphore::MAX_PERMITS,
            max => max,
        };

        Listener {
            shared: Arc::new(Shared {
                pool,
                accepts: AcceptPool::new(server_limits.accept_descriptors),
                permits: Arc::new(Semaphore::new(permits)),
                endpoints: Mutex::new(Endpoints {
                    desired: self.ports,
                    bound: BTreeMap::new(),
                }),
                server_limits,
                conn_limits,
                tls: self.tls,

                running: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }
}
