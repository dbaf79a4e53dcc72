//! The event reactor.
//!
//! One thread owns the poller, every listener, the timer heap, and the
//! per-connection framing and flood tables. Other threads reach it only
//! through the command channel plus waker, or (send thread only) by
//! re-arming writable interest under a slot's socket lock.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::clock::Timestamp;
use crate::connection::Slot;
use crate::error::Error;
use crate::frame::{verify_checksum, CompletePacket, ConnToken, Delivery, FrameEvent, Framer};
use crate::metrics;
use crate::sender::{push_bytes, WriteStatus};
use crate::server::{EngineHandle, EngineShared, ReactorCmd};
use crate::timer::{TimerHandle, TimerHeap};

/// Readiness events drained per poll call.
const MAX_EVENTS: usize = 512;

/// Token for the cross-thread waker. Listeners occupy the low token space
/// with connections above them, so the waker sits at the far end.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Per-connection flood window. Reactor-only state.
#[derive(Clone, Copy)]
struct FloodState {
    window_start: Timestamp,
    hits: u32,
}

impl FloodState {
    fn idle() -> Self {
        Self {
            window_start: Timestamp::INVALID,
            hits: 0,
        }
    }

    /// Account one completed packet. Returns true when the connection has
    /// crossed the kick threshold.
    fn register_packet(&mut self, now: Timestamp, interval_micros: i64, threshold: u32) -> bool {
        if self.window_start.is_valid() && now.micros_since(self.window_start) < interval_micros {
            self.hits += 1;
        } else {
            self.hits = 0;
        }
        self.window_start = now;
        self.hits >= threshold
    }
}

pub(crate) struct Reactor {
    poll: Poll,
    conn_base: usize,
    listeners: Vec<TcpListener>,
    max_packet: usize,
    /// Mirror of the pool's slot arena, indexed by slot. Only the reactor
    /// appends (it is the only acquirer), so lookups need no lock.
    slots: Vec<Arc<Slot>>,
    framers: Vec<Framer>,
    floods: Vec<FloodState>,
    timer_handles: Vec<Option<TimerHandle>>,
    timers: TimerHeap<ConnToken>,
    cmds: Receiver<ReactorCmd>,
    engine: EngineHandle,
    shared: Arc<EngineShared>,
}

impl Reactor {
    pub(crate) fn new(
        poll: Poll,
        listeners: Vec<TcpListener>,
        cmds: Receiver<ReactorCmd>,
        shared: Arc<EngineShared>,
    ) -> Self {
        let max_packet = shared.config.max_packet_bytes as usize;
        let mut slots = Vec::with_capacity(shared.config.max_connections as usize);
        for i in 0..shared.config.max_connections {
            if let Some(slot) = shared.pool.get(i) {
                slots.push(slot);
            }
        }
        let n = slots.len();
        Self {
            poll,
            conn_base: listeners.len(),
            listeners,
            max_packet,
            framers: (0..n).map(|_| Framer::new(max_packet)).collect(),
            floods: vec![FloodState::idle(); n],
            timer_handles: vec![None; n],
            timers: TimerHeap::new(),
            cmds,
            engine: EngineHandle::new(shared.clone()),
            shared,
            slots,
        }
    }

    pub(crate) fn run(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.shared.is_shutdown() {
            let timeout = self.process_timers();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("event poll failed: {e}");
                    self.teardown();
                    return Err(e.into());
                }
            }
            for event in events.iter() {
                self.dispatch(event);
            }
            self.drain_commands();
        }
        self.teardown();
        Ok(())
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        if token == WAKER_TOKEN {
            // Commands are drained after the event batch.
            return;
        }
        if token.0 < self.conn_base {
            self.accept_ready(token.0);
            return;
        }
        let idx = (token.0 - self.conn_base) as u32;
        // Error and hangup conditions fold into the read path so its close
        // handling observes them.
        let error_ish = event.is_error() || event.is_read_closed();
        if event.is_readable() || error_ish {
            self.conn_readable(idx);
        }
        if event.is_writable() && !error_ish {
            self.conn_writable(idx);
        }
    }

    // ── Accepting ────────────────────────────────────────────────────────

    fn accept_ready(&mut self, listener_idx: usize) {
        loop {
            let (stream, peer) = match self.listeners[listener_idx].accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => {
                    tracing::warn!("accept: connection aborted before accept");
                    continue;
                }
                Err(e) if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE)) => {
                    // No descriptor to accept into, and the closes that
                    // free one run on this thread. Give the loop back
                    // instead of retrying.
                    tracing::error!("accept: file descriptors exhausted: {e}");
                    return;
                }
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    return;
                }
            };
            self.install_connection(stream, peer);
        }
    }

    fn install_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.shared.pool.at_capacity() {
            metrics::CONNECTIONS_REJECTED.increment();
            return; // dropping the stream closes it
        }
        if self.shared.pool.storm_guard_rejects() {
            metrics::CONNECTIONS_REJECTED.increment();
            tracing::warn!("rejecting connect from {peer}: slot arena exhausted by churn");
            return;
        }
        if self.shared.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        let (idx, slot) = self.shared.pool.acquire();
        // Count the occupancy up front; mark_for_recycle undoes it on the
        // error path below.
        self.shared.pool.online_inc();
        self.ensure_tables(idx);
        let token = self.shared.conn_token(idx);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            tracing::error!("failed to register accepted socket: {e}");
            self.shared.pool.mark_for_recycle(idx);
            return;
        }
        {
            let mut sock = slot.lock_sock();
            sock.stream = Some(stream);
            sock.inflight = None;
            sock.peer = Some(peer);
        }
        let i = idx as usize;
        self.framers[i].reset();
        self.floods[i] = FloodState::idle();
        self.timer_handles[i] = None;
        if self.shared.config.idle_timeout_enabled {
            let deadline = Timestamp::now() + self.shared.config.idle_timeout();
            let handle = self.timers.add(deadline, slot.token());
            self.timer_handles[i] = Some(handle);
        }
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
    }

    /// Extend the reactor-side tables to cover a slot the pool just grew.
    fn ensure_tables(&mut self, idx: u32) {
        let needed = idx as usize + 1;
        while self.slots.len() < needed {
            let i = self.slots.len() as u32;
            let Some(slot) = self.shared.pool.get(i) else {
                break;
            };
            self.slots.push(slot);
            self.framers.push(Framer::new(self.max_packet));
            self.floods.push(FloodState::idle());
            self.timer_handles.push(None);
        }
    }

    // ── Reading ──────────────────────────────────────────────────────────

    fn conn_readable(&mut self, idx: u32) {
        let i = idx as usize;
        let Some(slot) = self.slots.get(i).cloned() else {
            return;
        };
        let mut packets: Vec<CompletePacket> = Vec::new();
        let mut close = false;
        {
            let mut sock = slot.lock_sock();
            let state = &mut *sock;
            let Some(stream) = state.stream.as_mut() else {
                return;
            };
            let framer = &mut self.framers[i];
            loop {
                let target = framer.next_read_target();
                match stream.read(target) {
                    // Orderly shutdown from the peer.
                    Ok(0) => {
                        close = true;
                        break;
                    }
                    Ok(n) => {
                        metrics::BYTES_RECEIVED.add(n as u64);
                        match framer.advance(n) {
                            FrameEvent::Incomplete => {}
                            FrameEvent::BadLength { pkg_len } => {
                                metrics::PACKETS_BAD_LENGTH.increment();
                                tracing::debug!(
                                    "connection {idx}: bad declared length {pkg_len}, resyncing"
                                );
                            }
                            FrameEvent::Packet(packet) => packets.push(packet),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        close = true;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("connection {idx}: read error: {e}");
                        close = true;
                        break;
                    }
                }
            }
        }
        for packet in packets {
            if self.shared.config.flood.enabled && self.flood_check(i) {
                metrics::FLOOD_KICKED.increment();
                tracing::warn!("connection {idx}: flood detected, closing");
                // The triggering packet and anything after it are discarded
                // with the connection.
                self.close_connection(idx);
                return;
            }
            self.deliver(&slot, packet);
        }
        if close {
            self.close_connection(idx);
        }
    }

    fn flood_check(&mut self, i: usize) -> bool {
        let interval = self.shared.config.flood_interval_micros();
        let threshold = self.shared.config.flood.kick_threshold;
        self.floods[i].register_packet(Timestamp::now(), interval, threshold)
    }

    /// Hand a framed packet to the worker pool. Checksum and staleness are
    /// validated on the worker, under the slot's logic lock.
    fn deliver(&mut self, slot: &Arc<Slot>, packet: CompletePacket) {
        metrics::PACKETS_DELIVERED.increment();
        let delivery = Delivery {
            token: slot.token(),
            header: packet.header,
            body: packet.body.freeze(),
        };
        let slot = slot.clone();
        let handler = self.shared.handler.clone();
        let engine = self.engine.clone();
        self.shared.workers.push_task(move || {
            if !verify_checksum(&delivery.header, &delivery.body) {
                metrics::PACKETS_CRC_FAILED.increment();
                return;
            }
            if !slot.is_current(delivery.token) {
                metrics::PACKETS_STALE_DROPPED.increment();
                return;
            }
            let _serialized = slot.logic.lock();
            handler.on_message(&engine, delivery);
        });
    }

    // ── Writing ──────────────────────────────────────────────────────────

    /// Continue a parked partial write now that the socket is writable.
    fn conn_writable(&mut self, idx: u32) {
        let i = idx as usize;
        let Some(slot) = self.slots.get(i).cloned() else {
            return;
        };
        let mut finished = false;
        {
            let mut sock = slot.lock_sock();
            let state = &mut *sock;
            let (Some(stream), Some(inflight)) = (state.stream.as_mut(), state.inflight.as_mut())
            else {
                return;
            };
            let frame = inflight.frame.clone();
            let (written, status) = push_bytes(stream, &frame, inflight.written);
            inflight.written = written;
            match status {
                WriteStatus::Blocked => {} // stay armed
                WriteStatus::Done => {
                    state.inflight = None;
                    finished = true;
                }
                // Broken peers are torn down by the read path; just stop
                // trying to flush.
                WriteStatus::PeerClosed | WriteStatus::Fatal => {
                    state.inflight = None;
                    finished = true;
                }
            }
            if finished {
                let fd = stream.as_raw_fd();
                if let Err(e) = self.poll.registry().reregister(
                    &mut SourceFd(&fd),
                    self.shared.conn_token(idx),
                    Interest::READABLE,
                ) {
                    tracing::debug!("connection {idx}: failed to disarm writable: {e}");
                }
            }
        }
        if finished {
            let _ = slot
                .partial_writes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
            // Messages skipped while this connection was blocked are now
            // sendable again.
            self.shared.outbound.nudge();
        }
    }

    // ── Closing ──────────────────────────────────────────────────────────

    fn close_connection(&mut self, idx: u32) {
        let i = idx as usize;
        let Some(slot) = self.slots.get(i).cloned() else {
            return;
        };
        if let Some(handle) = self.timer_handles.get_mut(i).and_then(|h| h.take()) {
            self.timers.cancel(handle);
        }
        {
            let mut sock = slot.lock_sock();
            if let Some(mut stream) = sock.stream.take() {
                let _ = self.poll.registry().deregister(&mut stream);
                // Dropping the stream closes the fd.
            }
            sock.inflight = None;
            sock.peer = None;
        }
        slot.partial_writes.store(0, Ordering::Release);
        self.framers[i].reset();
        if self.shared.pool.mark_for_recycle(idx) {
            metrics::CONNECTIONS_CLOSED.increment();
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────

    /// Evict or re-arm every expired deadline, then return how long the
    /// next poll may sleep. `None` means no timers are pending.
    fn process_timers(&mut self) -> Option<Duration> {
        if self.timers.is_empty() {
            return None;
        }
        let now = Timestamp::now();
        while let Some(token) = self.timers.pop_expired(now) {
            let i = token.slot() as usize;
            let Some(slot) = self.slots.get(i).cloned() else {
                continue;
            };
            if !slot.is_current(token) {
                // Slot was recycled out from under the deadline.
                continue;
            }
            self.timer_handles[i] = None;
            if self.shared.handler.on_ping_timeout(&self.engine, token, now) {
                metrics::TIMEOUTS_EVICTED.increment();
                self.close_connection(token.slot());
            } else {
                let deadline = now + self.shared.config.idle_timeout();
                let handle = self.timers.add(deadline, token);
                self.timer_handles[i] = Some(handle);
            }
        }
        self.timers
            .earliest()
            .map(|deadline| deadline.duration_since(now))
    }

    fn touch_timer(&mut self, token: ConnToken, deadline: Timestamp) {
        let i = token.slot() as usize;
        let current = self
            .slots
            .get(i)
            .map(|s| s.is_current(token))
            .unwrap_or(false);
        if !current {
            return;
        }
        // No armed timer means idle eviction is off for this connection;
        // nothing to reschedule.
        if let Some(Some(handle)) = self.timer_handles.get(i).copied() {
            self.timers.update(handle, deadline);
        }
    }

    // ── Commands and teardown ────────────────────────────────────────────

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmds.try_recv() {
            match cmd {
                ReactorCmd::TouchTimer { token, deadline } => self.touch_timer(token, deadline),
                ReactorCmd::Close { token } => {
                    let current = self
                        .slots
                        .get(token.slot() as usize)
                        .map(|s| s.is_current(token))
                        .unwrap_or(false);
                    if current {
                        self.close_connection(token.slot());
                    }
                }
            }
        }
    }

    fn teardown(&mut self) {
        for idx in 0..self.slots.len() as u32 {
            let open = self.slots[idx as usize].lock_sock().stream.is_some();
            if open {
                self.close_connection(idx);
            }
        }
        self.shared.pool.shutdown_recycler();
        self.shared.outbound.shutdown();
        // Let dispatched messages finish before the workers go away.
        self.shared.workers.wait_for_tasks();
        self.shared.workers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_trips_on_the_packet_after_the_threshold() {
        let mut flood = FloodState::idle();
        let base = Timestamp::from_micros(1_000_000);
        // Threshold 5: packets one through five pass, six trips.
        for i in 0..5 {
            let now = base + Duration::from_millis(i * 10);
            assert!(!flood.register_packet(now, 100_000, 5), "packet {i}");
        }
        let now = base + Duration::from_millis(50);
        assert!(flood.register_packet(now, 100_000, 5));
    }

    #[test]
    fn slow_packets_never_trip() {
        let mut flood = FloodState::idle();
        let base = Timestamp::from_micros(0);
        for i in 0..50u64 {
            let now = base + Duration::from_millis(i * 200);
            assert!(!flood.register_packet(now, 100_000, 5));
        }
    }

    #[test]
    fn a_pause_resets_the_count() {
        let mut flood = FloodState::idle();
        let base = Timestamp::from_micros(0);
        for i in 0..4u64 {
            flood.register_packet(base + Duration::from_millis(i * 10), 100_000, 5);
        }
        // Long gap, then another rapid burst: the earlier hits are gone.
        let resumed = base + Duration::from_secs(5);
        for i in 0..5u64 {
            assert!(!flood.register_packet(
                resumed + Duration::from_millis(i * 10),
                100_000,
                5
            ));
        }
        assert!(flood.register_packet(resumed + Duration::from_millis(50), 100_000, 5));
    }
}
