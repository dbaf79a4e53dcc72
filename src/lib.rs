//! An epoll-driven TCP server engine for length-prefixed packet protocols.
//!
//! packline speaks a fixed wire format, eight bytes of packed header
//! (big-endian `pkg_len`, `msg_code`, `crc32`) followed by the body, and
//! turns a socket's byte stream into whole, checksum-valid messages
//! delivered to an application [`EventHandler`] on a worker thread pool.
//!
//! The engine runs four kinds of threads over shared connection slots:
//! a reactor owning the poller, listeners, framing state, and heartbeat
//! timers; a send thread draining one global outbound queue with
//! partial-write parking; a recycle thread resting closed slots through a
//! cooldown before reuse; and the workers. Connection slots are reused,
//! never freed, and every cross-thread reference carries a generation so
//! work aimed at a closed connection is dropped instead of hitting its
//! successor.
//!
//! # Quick start
//!
//! ```no_run
//! use packline::{
//!     ConfigBuilder, Delivery, EngineHandle, EventHandler, OutboundMessage, PacklineBuilder,
//! };
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_message(&self, ctx: &EngineHandle, delivery: Delivery) {
//!         if let Ok(reply) =
//!             OutboundMessage::new(delivery.token, delivery.header.msg_code, &delivery.body)
//!         {
//!             ctx.send(reply);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), packline::Error> {
//!     let config = ConfigBuilder::new()
//!         .listen("127.0.0.1:9000".parse().unwrap())
//!         .build()?;
//!     let (_engine, shutdown, threads) = PacklineBuilder::new(config).launch(Echo)?;
//!     // ... run until told to stop ...
//!     shutdown.shutdown();
//!     for handle in threads {
//!         handle.join().unwrap()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. The reactor is built on epoll via mio and the listener and
//! rlimit plumbing call libc directly.

// ── Internal modules ─────────────────────────────────────────────────────

pub(crate) mod connection;
pub(crate) mod reactor;
pub(crate) mod sender;

// ── Public modules ───────────────────────────────────────────────────────

pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod server;
pub mod timer;
pub mod workers;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use clock::Timestamp;
pub use config::{Config, ConfigBuilder, FloodConfig};
pub use error::Error;
pub use frame::{checksum, verify_checksum, ConnToken, Delivery, OutboundMessage, PacketHeader, PKG_HEADER_SIZE};
pub use server::{EngineHandle, EventHandler, LaunchResult, PacklineBuilder, ShutdownHandle};
pub use timer::{TimerHandle, TimerHeap};
pub use workers::{TaskFuture, TaskPanicked, WorkerPool};
