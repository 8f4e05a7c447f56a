//! Echo server on two ports.
//!
//! After ten seconds it moves from 7000/7001 to 7001/7002 without touching
//! connections on 7001.
//!
//! ```text
//! RUST_LOG=connpool=debug cargo run --example echo
//! ```

use connpool::{limits::ServerLimits, Action, Context, Listener, Protocol, SocketIo};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Echo {
    echoed: usize,
}

impl Protocol for Echo {
    fn initialize<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        Action::Receive(0)
    }

    fn receive<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        let (rx, tx) = cx.queues();
        self.echoed += rx.move_to(tx, None);
        Action::Send
    }

    fn reset(&mut self) {
        self.echoed = 0;
    }
}

#[tokio::main]
async fn main() -> connpool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = Listener::builder()
        .ports([7000, 7001])
        .factory(Echo::default)
        .server_limits(ServerLimits {
            max_connections: 256,
            ..ServerLimits::default()
        })
        .build();

    let started = listener.start()?;
    info!(opened = ?started.opened, failed = ?started.failed, "echo server up");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(10)) => {
            let moved = listener.reconfigure(&[7001, 7002]);
            info!(closed = ?moved.closed, opened = ?moved.opened, "ports moved");
            let _ = tokio::signal::ctrl_c().await;
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    let drained = listener.stop().await;
    info!(drained, stats = ?listener.accept_stats(), "echo server down");
    Ok(())
}
