//! connpool - pooled, event-driven TCP connection engine
//!
//! Connections are served by pooled handler instances. Each handler drives a
//! plugged-in [`Protocol`] as a small state machine: every hook inspects the
//! connection's rx/tx queues and returns the next [`Action`] (receive, send,
//! run an async step, hand control back, disconnect), and the engine performs
//! that action before calling back.
//!
//! # Building blocks
//!
//! - [`Listener`] - binds ports, reconfigures them at runtime and hands
//!   accepted sockets to handlers under a global connection ceiling
//! - [`HandlerPool`] - bounded instance reuse plus a periodic timeout sweep
//! - [`tls`] - in-place TLS negotiation over any [`SocketIo`]
//! - [`channel::ChannelMap`] - named logical channels sharing one connection,
//!   with explicit yield/continue backpressure
//! - [`http`] - allocation-light request and response header parsing
//! - [`splice::SplicePool`] - outbound legs for relaying proxies
//! - [`SimSocket`] - an in-memory transport for deterministic tests
//!
//! # Examples
//!
//! A line-oriented upper-casing service:
//! ```no_run
//! use connpool::{Action, Context, Listener, Protocol, SocketIo};
//!
//! #[derive(Default)]
//! struct Upper;
//!
//! impl Protocol for Upper {
//!     fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
//!         Action::Receive(0)
//!     }
//!
//!     fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
//!         let Some(end) = cx.rx().index_of(b'\n') else {
//!             return Action::Receive(0);
//!         };
//!         let line = cx.rx().remove_exact(end + 1).unwrap_or_default();
//!         cx.tx().add(&line.to_ascii_uppercase());
//!         Action::Send
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> connpool::Result<()> {
//!     let listener = Listener::builder()
//!         .ports([7000])
//!         .factory(Upper::default)
//!         .build();
//!
//!     listener.start()?;
//!     tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! Handing a connection to another handler for a while:
//! ```no_run
//! use connpool::{http::StatusResponder, Action, Context, HandlerPool, Protocol, SocketIo};
//! use std::sync::Arc;
//!
//! struct Gate {
//!     busy: Arc<HandlerPool<StatusResponder>>,
//! }
//!
//! impl Protocol for Gate {
//!     fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
//!         Action::AsyncAction
//!     }
//!
//!     fn receive<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
//!         Action::Disconnect
//!     }
//!
//!     async fn async_action<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
//!         // Writes "503 Service Unavailable", then returns control here.
//!         match cx.delegate(&self.busy, |_| {}).await {
//!             Ok(connpool::Outcome::Released) => Action::Disconnect,
//!             _ => Action::Dispose,
//!         }
//!     }
//! }
//! ```

pub mod channel {
    //! Named logical channels multiplexed over one connection
    pub mod frame;
    pub mod map;

    pub use frame::{Frame, FrameKind};
    pub use map::{ChannelMap, Signal};
}
pub mod http {
    //! HTTP/1.x header blocks
    pub mod request;
    pub mod response;
    pub mod types;

    pub use request::{header_end, RequestHeader};
    pub use response::{write_status, ResponseHeader, StatusResponder};
    pub use types::{Method, StatusCode, Version};
}
pub(crate) mod server {
    pub(crate) mod accept;
    pub(crate) mod handler;
    pub(crate) mod listener;
    pub(crate) mod pool;
}
pub mod tls {
    //! TLS over any [`SocketIo`](crate::SocketIo)
    pub mod adapter;
    pub mod session;

    pub use adapter::{AdapterState, StreamAdapter};
    pub use session::TlsSession;
}
pub mod errors;
pub mod limits;
pub mod queue;
pub mod socket;
pub mod splice;

pub use crate::{
    errors::{Error, Result},
    queue::{ByteQueue, SharedQueue},
    server::{
        accept::{AcceptDescriptor, AcceptStats},
        handler::{Action, Context, Handler, Link, Liveness, Outcome, Protocol},
        listener::{plan_ports, Listener, ListenerBuilder, Reconfigured},
        pool::{HandlerPool, Lease},
    },
    socket::{Connector, SimSocket, SocketIo, TcpSocket},
};

#[doc(hidden)]
#[macro_export]
macro_rules! impl_echo_protocol {
    ($name:ident) => {
        use connpool::{Action, Context, Protocol, SocketIo};
        struct $name;

        impl Protocol for $name {
            fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
                Action::Receive(0)
            }

            fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
                let (rx, tx) = cx.queues();
                rx.move_to(tx, None);
                Action::Send
            }
        }
    };
}

#[cfg(test)]
pub mod tools {
    use crate::{
        limits::{ConnLimits, ServerLimits},
        Action, Context, Link, Protocol, SocketIo,
    };
    use rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
        ClientConfig, RootCertStore, ServerConfig,
    };
    use std::{
        net::{IpAddr, Ipv4Addr, TcpListener},
        sync::Arc,
        time::Duration,
    };

    const CERT: &[u8] = include_bytes!("../testdata/cert.der");
    const KEY: &[u8] = include_bytes!("../testdata/key.der");

    #[inline]
    pub fn sim_link() -> Link {
        Link::new(0, None, ConnLimits::default())
    }

    /// A port that was free a moment ago.
    pub fn free_port() -> u16 {
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    }

    pub fn local_limits(max_connections: usize) -> ServerLimits {
        ServerLimits {
            max_connections,
            accept_descriptors: 4,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            shutdown_grace: Duration::from_secs(2),
            maintenance_interval: Duration::from_millis(100),
            ..ServerLimits::default()
        }
    }

    #[derive(Debug, Default)]
    pub struct Echo;

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

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn tls_server_config() -> Arc<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(KEY.to_vec()));
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(CERT.to_vec())], key)
            .unwrap();
        Arc::new(config)
    }

    pub fn tls_client_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(CERT.to_vec())).unwrap();

        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Arc::new(config)
    }
}
