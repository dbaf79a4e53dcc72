//! Minimal heartbeat/echo server.
//!
//! Heartbeats (msg code 0, empty body) push the connection's idle deadline
//! forward and get an empty reply; anything else is echoed back verbatim.
//!
//! Run with: cargo run --example ping_server -- 127.0.0.1:9000

use std::time::Duration;

use packline::{
    ConfigBuilder, ConnToken, Delivery, EngineHandle, EventHandler, OutboundMessage,
    PacklineBuilder, Timestamp,
};

const MSG_PING: u16 = 0;

struct PingServer {
    idle: Duration,
}

impl EventHandler for PingServer {
    fn on_message(&self, ctx: &EngineHandle, delivery: Delivery) {
        if delivery.header.msg_code == MSG_PING && delivery.body.is_empty() {
            ctx.touch_timer(delivery.token, Timestamp::now() + self.idle);
            if let Ok(reply) = OutboundMessage::new(delivery.token, MSG_PING, &[]) {
                ctx.send(reply);
            }
            return;
        }
        match OutboundMessage::new(delivery.token, delivery.header.msg_code, &delivery.body) {
            Ok(reply) => ctx.send(reply),
            Err(e) => tracing::warn!("dropping unencodable reply: {e}"),
        }
    }

    fn on_ping_timeout(&self, _ctx: &EngineHandle, token: ConnToken, _now: Timestamp) -> bool {
        tracing::info!("evicting idle connection on slot {}", token.slot());
        true
    }
}

fn main() -> Result<(), packline::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let idle_secs = 60;
    let config = ConfigBuilder::new()
        .listen(addr.parse().expect("invalid listen address"))
        .idle_timeout_secs(idle_secs)
        .build()?;
    tracing::info!("listening on {addr}");

    let (_engine, _shutdown, threads) = PacklineBuilder::new(config).launch(PingServer {
        idle: Duration::from_secs(idle_secs),
    })?;
    for handle in threads {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(packline::Error::Setup("engine thread panicked".into())),
        }
    }
    Ok(())
}
