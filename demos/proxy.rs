//! HTTP relay built on the splice pool.
//!
//! Every request on port 8080 is relayed to the host named by its `Host`
//! header (or its absolute-form target). When no outbound leg is free the
//! client gets `503 Service Unavailable` from a pooled responder.
//!
//! ```text
//! RUST_LOG=connpool=debug,proxy=info cargo run --example proxy
//! curl -x http://127.0.0.1:8080 http://example.com/
//! ```

use connpool::{
    http::{header_end, write_status, RequestHeader, StatusCode, StatusResponder, Version},
    limits::ConnLimits,
    socket::TcpConnector,
    splice::{relay_step, Pairing, Side, SplicePool},
    Action, Context, HandlerPool, Listener, Protocol, SocketIo,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_HEADER: usize = 16 * 1024;

struct Relay {
    splice: Arc<SplicePool<TcpConnector>>,
    busy: Arc<HandlerPool<StatusResponder>>,
    pairing: Option<Arc<Pairing>>,
    refused: bool,
}

/// `host:port` of an absolute URI, with the scheme's port filled in.
fn upstream(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once("://")?;
    let authority = rest.split('/').next()?;

    match authority.rsplit_once(':') {
        Some((_, port)) if !port.contains(']') => Some(authority.to_owned()),
        _ => {
            let port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
            Some(format!("{authority}:{port}"))
        }
    }
}

impl Protocol for Relay {
    fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        Action::Receive(0)
    }

    fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        if self.pairing.is_some() {
            return Action::AsyncAction;
        }

        let Some(end) = header_end(cx.rx().as_slice()) else {
            if cx.rx().len() > MAX_HEADER {
                let tx = cx.tx();
                write_status(tx, Version::Http11, StatusCode::RequestHeaderFieldsTooLarge, b"", true);
                return Action::Send;
            }
            return Action::Receive(0);
        };

        let (tls, port) = (cx.is_tls(), cx.local_port());
        let request = RequestHeader::parse(&cx.rx().as_slice()[..end], tls, port);
        let version = request.version().unwrap_or(Version::Http11);

        let Some(target) = request.uri().and_then(upstream) else {
            write_status(cx.tx(), version, StatusCode::BadRequest, b"bad request", true);
            return Action::Send;
        };

        match self.splice.capture(cx.id(), &target) {
            Some(pairing) => {
                info!(method = request.method(), uri = ?request.uri(), "relaying");
                self.pairing = Some(pairing);
            }
            None => self.refused = true,
        }
        Action::AsyncAction
    }

    fn send<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        match self.pairing {
            Some(_) => Action::AsyncAction,
            None => Action::Disconnect,
        }
    }

    async fn async_action<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        if let Some(pairing) = self.pairing.clone() {
            return relay_step(&pairing, Side::Inbound, cx).await;
        }

        if self.refused {
            if let Err(err) = cx.delegate(&self.busy, |_| {}).await {
                warn!(error = %err, "could not answer refused request");
            }
        }
        Action::Disconnect
    }

    fn reset(&mut self) {
        if let Some(pairing) = self.pairing.take() {
            pairing.close();
        }
        self.refused = false;
    }
}

#[tokio::main]
async fn main() -> connpool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let limits = ConnLimits {
        async_timeout: Duration::from_secs(120),
        ..ConnLimits::default()
    };

    let splice = Arc::new(SplicePool::new(TcpConnector::new(limits.clone()), limits.clone(), 128));
    splice.start(Duration::from_secs(1));

    let busy = HandlerPool::new(StatusResponder::default, limits.clone(), 0);

    let listener = Listener::builder()
        .ports([8080])
        .factory({
            let splice = splice.clone();
            move || Relay {
                splice: splice.clone(),
                busy: busy.clone(),
                pairing: None,
                refused: false,
            }
        })
        .connection_limits(limits)
        .build();

    listener.start()?;
    info!("proxy listening on 8080");

    let _ = tokio::signal::ctrl_c().await;
    let closed = splice.stop();
    listener.stop().await;
    info!(closed, "proxy stopped");
    Ok(())
}
