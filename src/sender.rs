//! Outbound queue and the send thread.
//!
//! All sends funnel through one global FIFO drained by a dedicated thread.
//! Messages for a connection that is blocked on an earlier partial write
//! are left in place so per-connection order survives backpressure; the
//! parked remainder lives on the slot and is flushed by the reactor when
//! the socket turns writable again.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::Interest;
use parking_lot::{Condvar, Mutex};

use crate::connection::{InflightSend, Slot};
use crate::error::Error;
use crate::frame::OutboundMessage;
use crate::metrics;
use crate::server::EngineShared;

pub(crate) struct OutboundEntry {
    pub(crate) msg: OutboundMessage,
    pub(crate) slot: Arc<Slot>,
}

struct QueueInner {
    queue: VecDeque<OutboundEntry>,
    /// Bumped by enqueues and by flush completions so the drain loop
    /// re-scans exactly when something may have become sendable.
    wakeups: u64,
    shutdown: bool,
}

/// The global outbound FIFO.
pub(crate) struct SendQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    capacity: usize,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                wakeups: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Queue a message. Returns false (dropping the message) when the
    /// global cap is hit or the queue is shut down.
    pub(crate) fn enqueue(&self, entry: OutboundEntry) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return false;
            }
            if inner.queue.len() >= self.capacity {
                metrics::SEND_DISCARDED.increment();
                return false;
            }
            entry.slot.queued_sends.fetch_add(1, Ordering::AcqRel);
            inner.queue.push_back(entry);
            inner.wakeups += 1;
        }
        self.cond.notify_one();
        true
    }

    /// Wake the drain loop after a blocked connection finished flushing.
    pub(crate) fn nudge(&self) {
        {
            let mut inner = self.inner.lock();
            inner.wakeups += 1;
        }
        self.cond.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.shutdown = true;
            inner.wakeups += 1;
        }
        self.cond.notify_all();
    }

    /// Block until a message can be attempted, dropping stale entries on
    /// the way. Returns `None` once shut down, after freeing the queue.
    fn next_sendable(&self) -> Option<OutboundEntry> {
        let mut inner = self.inner.lock();
        loop {
            let mut i = 0;
            let mut found = None;
            while i < inner.queue.len() {
                let entry = &inner.queue[i];
                if !entry.slot.is_current(entry.msg.token()) {
                    if let Some(stale) = inner.queue.remove(i) {
                        dec_queued(&stale.slot);
                        metrics::SEND_STALE_DROPPED.increment();
                    }
                    continue;
                }
                if entry.slot.partial_writes.load(Ordering::Acquire) > 0 {
                    // Blocked on an earlier partial write: keep in order.
                    i += 1;
                    continue;
                }
                found = Some(i);
                break;
            }
            if let Some(i) = found {
                if let Some(entry) = inner.queue.remove(i) {
                    dec_queued(&entry.slot);
                    return Some(entry);
                }
            }
            if inner.shutdown {
                while let Some(entry) = inner.queue.pop_front() {
                    dec_queued(&entry.slot);
                }
                return None;
            }
            if inner.wakeups == 0 {
                self.cond.wait(&mut inner);
            } else {
                inner.wakeups = 0;
            }
        }
    }
}

fn dec_queued(slot: &Slot) {
    let _ = slot
        .queued_sends
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

/// Result of pushing bytes at a nonblocking socket.
pub(crate) enum WriteStatus {
    Done,
    Blocked,
    PeerClosed,
    Fatal,
}

/// Write `frame[written..]` until done or the socket pushes back.
pub(crate) fn push_bytes(
    stream: &mut TcpStream,
    frame: &[u8],
    mut written: usize,
) -> (usize, WriteStatus) {
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return (written, WriteStatus::PeerClosed),
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                written += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return (written, WriteStatus::Blocked)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return (written, WriteStatus::Fatal),
        }
    }
    (written, WriteStatus::Done)
}

/// Send thread body.
pub(crate) fn run(shared: Arc<EngineShared>) -> Result<(), Error> {
    loop {
        match shared.outbound.next_sendable() {
            Some(entry) => transmit(&shared, entry),
            None => return Ok(()),
        }
    }
}

fn transmit(shared: &EngineShared, entry: OutboundEntry) {
    let OutboundEntry { msg, slot } = entry;
    let mut sock = slot.lock_sock();
    let state = &mut *sock;
    let Some(stream) = state.stream.as_mut() else {
        // Closed since the message was queued.
        return;
    };
    let fd = stream.as_raw_fd();
    let frame = msg.frame().clone();
    let (written, status) = push_bytes(stream, &frame, 0);
    match status {
        WriteStatus::Done => {}
        // A vanished or broken peer is torn down by the read path.
        WriteStatus::PeerClosed | WriteStatus::Fatal => {}
        WriteStatus::Blocked => {
            state.inflight = Some(InflightSend { frame, written });
            slot.partial_writes.fetch_add(1, Ordering::AcqRel);
            metrics::SEND_PARTIAL_WRITES.increment();
            // Arm writable interest. Safe off-reactor: the slot's socket
            // lock is held, so the fd cannot be closed underneath us.
            if let Err(e) = shared.registry.reregister(
                &mut SourceFd(&fd),
                shared.conn_token(slot.index()),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                tracing::warn!("failed to arm writable interest: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionPool;

    fn entry_for(slot: &Arc<Slot>, body: &[u8]) -> OutboundEntry {
        OutboundEntry {
            msg: OutboundMessage::new(slot.token(), 1, body).unwrap(),
            slot: slot.clone(),
        }
    }

    #[test]
    fn global_cap_drops_excess() {
        let pool = ConnectionPool::new(&Config::default());
        let (_, slot) = pool.acquire();
        let q = SendQueue::new(2);
        assert!(q.enqueue(entry_for(&slot, b"a")));
        assert!(q.enqueue(entry_for(&slot, b"b")));
        assert!(!q.enqueue(entry_for(&slot, b"c")));
        assert_eq!(slot.queued_sends.load(Ordering::Acquire), 2);
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let pool = ConnectionPool::new(&Config::default());
        let (_, slot) = pool.acquire();
        let q = SendQueue::new(8);
        q.shutdown();
        assert!(!q.enqueue(entry_for(&slot, b"late")));
    }

    #[test]
    fn stale_entries_are_dropped_at_drain() {
        let pool = ConnectionPool::new(&Config::default());
        let (idx, slot) = pool.acquire();
        let q = SendQueue::new(8);
        assert!(q.enqueue(entry_for(&slot, b"one")));
        assert!(q.enqueue(entry_for(&slot, b"two")));
        assert_eq!(slot.queued_sends.load(Ordering::Acquire), 2);
        // Closing bumps the generation, so both entries go stale.
        pool.mark_for_recycle(idx);
        q.shutdown();
        assert!(q.next_sendable().is_none());
        assert_eq!(slot.queued_sends.load(Ordering::Acquire), 0);
    }

    #[test]
    fn blocked_connection_keeps_messages_queued() {
        let pool = ConnectionPool::new(&Config::default());
        let (_, slot) = pool.acquire();
        slot.partial_writes.store(1, Ordering::Release);
        let q = SendQueue::new(8);
        assert!(q.enqueue(entry_for(&slot, b"held")));
        // Nothing sendable while blocked; shutdown frees the held entry.
        q.shutdown();
        assert!(q.next_sendable().is_none());
        assert_eq!(slot.queued_sends.load(Ordering::Acquire), 0);
    }

    #[test]
    fn current_entry_is_dequeued_in_order() {
        let pool = ConnectionPool::new(&Config::default());
        let (_, slot) = pool.acquire();
        let q = SendQueue::new(8);
        assert!(q.enqueue(entry_for(&slot, b"first")));
        assert!(q.enqueue(entry_for(&slot, b"second")));
        let got = q.next_sendable().unwrap();
        assert_eq!(&got.msg.frame()[crate::frame::PKG_HEADER_SIZE..], b"first");
        assert_eq!(slot.queued_sends.load(Ordering::Acquire), 1);
    }
}
