//! Engine configuration limits and timeouts
//!
//! The engine does not load configuration files itself. Callers build these
//! structures (from files, environment or code) and hand them to the
//! [`Listener`](crate::Listener) builder or to a [`HandlerPool`](crate::HandlerPool).
//!
//! # Examples
//!
//! ```no_run
//! use connpool::{Action, Context, Listener, Protocol, SocketIo};
//! use connpool::limits::{ConnLimits, ServerLimits};
//! use std::time::Duration;
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn initialize<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
//!         Action::Receive(cx.buffer_size())
//!     }
//!
//!     fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
//!         let (rx, tx) = cx.queues();
//!         rx.move_to(tx, None);
//!         Action::Send
//!     }
//!
//!     fn reset(&mut self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> connpool::Result<()> {
//!     let listener = Listener::builder()
//!         .ports([8080, 8443])
//!         .factory(|| Echo)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             receive_timeout: Duration::from_secs(30),
//!             ..ConnLimits::default()
//!         })
//!         .build();
//!
//!     listener.start()?;
//!     tokio::time::sleep(Duration::from_secs(3600)).await;
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```

use crate::server::handler::Action;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

/// Controls listener-level concurrency and shutdown behavior.
///
/// # Connection management
/// ```text
///    [ port 8080 ]  [ port 8443 ]  ...      one accept loop per port
///          \\            //
///           V            V
///     /-------------------------\   No   [----------------]
///     | Permit available?        | =====> [ Wait for close ]
///     \-------------------------/        [----------------]
///                 || Yes
///                 \/
///     /-------------------------\   No   [--------------]
///     | Handler in the pool?     | =====> [ Close socket ]
///     \-------------------------/        [--------------]
///                 || Yes
///                 \/
///           [ Worker task ]
/// ```
///
/// A permit is held from accept until the handler has been returned to its
/// pool, so `max_connections` bounds accepted-but-unhandled sockets across
/// *all* ports.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Global connection ceiling shared by every port (default: `1000`).
    ///
    /// Also the ceiling on handler instances created by the listener's pool.
    /// `0` means unlimited.
    pub max_connections: usize,

    /// Number of pre-allocated accept descriptors (default: `16`).
    pub accept_descriptors: usize,

    /// Listen backlog passed to every bound socket (default: `1024`).
    pub backlog: i32,

    /// Address every configured port is bound on (default: `0.0.0.0`).
    pub bind_addr: IpAddr,

    /// How long [`stop`](crate::Listener::stop) waits for live connections
    /// to finish (default: `10 seconds`).
    pub shutdown_grace: Duration,

    /// Period of the handler pool's timeout sweep (default: `1 second`).
    pub maintenance_interval: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            accept_descriptors: 16,
            backlog: 1024,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            shutdown_grace: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(1),

            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts
///
/// The stage timeouts are defaults: a protocol hook may arm its own deadline
/// for the next stage with [`Context::set_timeout`](crate::Context::set_timeout).
/// A deadline is measured from the last activity on the connection, and the
/// maintenance sweep closes the connection once it passes.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Socket buffer size, and the unit for channel backpressure
    /// thresholds (default: `64 KiB`).
    ///
    /// Each receive stage reads at most this many bytes at once. See
    /// [`ChannelMap`](crate::channel::ChannelMap) for the multiples used by flow control.
    pub socket_buffer_size: usize,

    /// Deadline armed when a handler is taken from its pool (default: `30 seconds`)
    pub initial_timeout: Duration,

    /// Default deadline for a `Receive` stage (default: `120 seconds`)
    ///
    /// This is the primary mechanism for cleaning up stalled connections.
    pub receive_timeout: Duration,

    /// Default deadline for a `Send` stage (default: `60 seconds`)
    pub send_timeout: Duration,

    /// Default deadline for an `AsyncAction` stage (default: `5 minutes`)
    pub async_timeout: Duration,

    /// `SO_KEEPALIVE` on accepted and connected sockets (default: `true`)
    pub keepalive: bool,

    /// `TCP_NODELAY` on accepted and connected sockets (default: `true`)
    pub no_delay: bool,

    /// `SO_LINGER` on accepted and connected sockets (default: `None`)
    pub linger: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_buffer_size: 64 * 1024,
            initial_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(120),
            send_timeout: Duration::from_secs(60),
            async_timeout: Duration::from_secs(300),
            keepalive: true,
            no_delay: true,
            linger: None,

            _priv: (),
        }
    }
}

impl ConnLimits {
    /// Default deadline for the stage that executes `action`, if it has one.
    #[inline]
    pub(crate) fn stage_timeout(&self, action: &Action) -> Option<Duration> {
        match action {
            Action::Receive(_) => Some(self.receive_timeout),
            Action::Send => Some(self.send_timeout),
            Action::AsyncAction => Some(self.async_timeout),
            _ => None,
        }
    }
}

/// Whether and how accepted connections negotiate TLS in place.
#[derive(Debug, Clone, Default)]
pub enum TlsPolicy {
    /// Plain TCP only (default).
    #[default]
    Disabled,

    /// TLS when the first byte from the client looks like a handshake record
    /// (`0x16`), plain TCP otherwise. Bytes read while sniffing are never lost.
    Optional(Arc<rustls::ServerConfig>),

    /// Every connection must complete a TLS handshake before the protocol's
    /// `initialize` hook runs.
    Required(Arc<rustls::ServerConfig>),
}

impl TlsPolicy {
    #[inline]
    pub(crate) fn config(&self) -> Option<&Arc<rustls::ServerConfig>> {
        match self {
            TlsPolicy::Disabled => None,
            TlsPolicy::Optional(config) | TlsPolicy::Required(config) => Some(config),
        }
    }
}
