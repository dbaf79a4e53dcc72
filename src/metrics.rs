//! Engine metrics.
//!
//! All metrics register with the global [`metriken`] registry and can be
//! scraped by whatever exposition layer the embedding application runs.

use metriken::{metric, Counter, Gauge};

// ── Connections ──────────────────────────────────────────────────────────

#[metric(
    name = "packline/connections/accepted",
    description = "connections accepted across all listeners"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "packline/connections/closed",
    description = "connections closed and routed to the recycle queue"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "packline/connections/rejected",
    description = "connections closed at accept by the online-limit or pool-growth guard"
)]
pub static CONNECTIONS_REJECTED: Counter = Counter::new();

#[metric(
    name = "packline/connections/active",
    description = "connections currently online"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Wire traffic ─────────────────────────────────────────────────────────

#[metric(
    name = "packline/bytes/received",
    description = "bytes read off accepted sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "packline/bytes/sent",
    description = "bytes written to accepted sockets"
)]
pub static BYTES_SENT: Counter = Counter::new();

// ── Inbound packets ──────────────────────────────────────────────────────

#[metric(
    name = "packline/packets/delivered",
    description = "complete packets handed to the worker pool"
)]
pub static PACKETS_DELIVERED: Counter = Counter::new();

#[metric(
    name = "packline/packets/bad_length",
    description = "headers with an out-of-bounds declared length, dropped with resync"
)]
pub static PACKETS_BAD_LENGTH: Counter = Counter::new();

#[metric(
    name = "packline/packets/crc_failed",
    description = "packets dropped for a checksum mismatch"
)]
pub static PACKETS_CRC_FAILED: Counter = Counter::new();

#[metric(
    name = "packline/packets/stale_dropped",
    description = "packets dropped because the connection was recycled before dispatch"
)]
pub static PACKETS_STALE_DROPPED: Counter = Counter::new();

// ── Outbound pipeline ────────────────────────────────────────────────────

#[metric(
    name = "packline/send/discarded",
    description = "outbound messages dropped by the global or per-connection cap"
)]
pub static SEND_DISCARDED: Counter = Counter::new();

#[metric(
    name = "packline/send/stale_dropped",
    description = "outbound messages dropped for a stale connection generation"
)]
pub static SEND_STALE_DROPPED: Counter = Counter::new();

#[metric(
    name = "packline/send/partial_writes",
    description = "writes parked on backpressure awaiting writability"
)]
pub static SEND_PARTIAL_WRITES: Counter = Counter::new();

// ── Protection ───────────────────────────────────────────────────────────

#[metric(
    name = "packline/flood/kicked",
    description = "connections force-closed by flood detection"
)]
pub static FLOOD_KICKED: Counter = Counter::new();

#[metric(
    name = "packline/timeouts/evicted",
    description = "connections closed by idle-timeout eviction"
)]
pub static TIMEOUTS_EVICTED: Counter = Counter::new();
