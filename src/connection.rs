//! Connection slots and the reusable pool.
//!
//! Slots are allocated up front and grow on demand; they are never freed
//! while the engine runs. Every cross-thread reference to a connection
//! carries the slot's generation, bumped when the slot is issued, when it
//! enters the recycle queue, and when it returns to the free list, so a
//! reference from a previous occupancy can never act on the next one.
//!
//! Closed slots rest in a recycle queue for a configured cooldown before
//! becoming reusable, giving in-flight worker and send-queue references
//! time to observe the stale generation and drop out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::TcpStream;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::clock::Timestamp;
use crate::config::Config;
use crate::frame::ConnToken;

/// An unfinished write parked on backpressure. `written` bytes of `frame`
/// have already reached the socket.
pub(crate) struct InflightSend {
    pub(crate) frame: Bytes,
    pub(crate) written: usize,
}

/// Socket-side state shared between the reactor and the send thread.
pub(crate) struct SockState {
    pub(crate) stream: Option<TcpStream>,
    pub(crate) inflight: Option<InflightSend>,
    pub(crate) peer: Option<SocketAddr>,
}

/// One connection slot.
///
/// Reactor-only state (framing, flood window, timer handle) lives in tables
/// owned by the reactor; this struct holds only what crosses threads.
pub(crate) struct Slot {
    index: u32,
    generation: AtomicU64,
    pub(crate) sock: Mutex<SockState>,
    /// Outbound messages queued for this connection.
    pub(crate) queued_sends: AtomicU32,
    /// Nonzero while a partial write is parked awaiting writability.
    pub(crate) partial_writes: AtomicU32,
    /// Serializes message callbacks for this connection. Workers only.
    pub(crate) logic: Mutex<()>,
}

impl Slot {
    fn new(index: u32) -> Self {
        Self {
            index,
            generation: AtomicU64::new(0),
            sock: Mutex::new(SockState {
                stream: None,
                inflight: None,
                peer: None,
            }),
            queued_sends: AtomicU32::new(0),
            partial_writes: AtomicU32::new(0),
            logic: Mutex::new(()),
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Token naming the current occupancy.
    pub(crate) fn token(&self) -> ConnToken {
        ConnToken::new(self.index, self.generation())
    }

    pub(crate) fn is_current(&self, token: ConnToken) -> bool {
        token.slot() == self.index && token.generation() == self.generation()
    }

    pub(crate) fn lock_sock(&self) -> MutexGuard<'_, SockState> {
        self.sock.lock()
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn begin_use(&self) {
        self.bump_generation();
        self.queued_sends.store(0, Ordering::Release);
        self.partial_writes.store(0, Ordering::Release);
    }
}

struct PoolInner {
    slots: Vec<Arc<Slot>>,
    free: Vec<u32>,
}

struct RecycleSet {
    /// Slot index to the time it entered the queue.
    entries: HashMap<u32, Timestamp>,
    shutdown: bool,
}

/// Growable arena of connection slots plus the recycle queue.
pub(crate) struct ConnectionPool {
    inner: Mutex<PoolInner>,
    recycle: Mutex<RecycleSet>,
    recycle_cond: Condvar,
    recycle_wait: Duration,
    online: AtomicI64,
    max_connections: u32,
    growth_limit: u32,
}

impl ConnectionPool {
    pub(crate) fn new(config: &Config) -> Self {
        let max = config.max_connections;
        let slots = (0..max).map(|i| Arc::new(Slot::new(i))).collect();
        // Reversed so the lowest index is issued first.
        let free = (0..max).rev().collect();
        Self {
            inner: Mutex::new(PoolInner { slots, free }),
            recycle: Mutex::new(RecycleSet {
                entries: HashMap::new(),
                shutdown: false,
            }),
            recycle_cond: Condvar::new(),
            recycle_wait: config.recycle_wait(),
            online: AtomicI64::new(0),
            max_connections: max,
            growth_limit: config.pool_growth_limit,
        }
    }

    /// Issue a slot, growing the arena if the free list is empty. The slot
    /// comes back with a fresh generation and cleared counters.
    pub(crate) fn acquire(&self) -> (u32, Arc<Slot>) {
        let (idx, slot) = {
            let mut inner = self.inner.lock();
            let idx = match inner.free.pop() {
                Some(idx) => idx,
                None => {
                    let idx = inner.slots.len() as u32;
                    inner.slots.push(Arc::new(Slot::new(idx)));
                    idx
                }
            };
            (idx, inner.slots[idx as usize].clone())
        };
        slot.begin_use();
        (idx, slot)
    }

    pub(crate) fn get(&self, idx: u32) -> Option<Arc<Slot>> {
        self.inner.lock().slots.get(idx as usize).cloned()
    }

    /// (total slots, free slots)
    pub(crate) fn totals(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.slots.len(), inner.free.len())
    }

    pub(crate) fn online(&self) -> i64 {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn online_inc(&self) {
        self.online.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether the online count has reached the configured ceiling.
    pub(crate) fn at_capacity(&self) -> bool {
        self.online() >= self.max_connections as i64
    }

    /// Whether a connect/close storm has outgrown the arena: total slots
    /// past `growth_limit * max_connections` while fewer than
    /// `max_connections` are free.
    pub(crate) fn storm_guard_rejects(&self) -> bool {
        let (total, free) = self.totals();
        total > self.growth_limit as usize * self.max_connections as usize
            && free < self.max_connections as usize
    }

    /// Queue a closed slot for cooldown. Idempotent; the first call bumps
    /// the generation (invalidating in-flight references) and decrements
    /// the online count.
    pub(crate) fn mark_for_recycle(&self, idx: u32) -> bool {
        let Some(slot) = self.get(idx) else {
            return false;
        };
        let newly = {
            let mut set = self.recycle.lock();
            if set.entries.contains_key(&idx) {
                false
            } else {
                slot.bump_generation();
                set.entries.insert(idx, Timestamp::now());
                true
            }
        };
        if newly {
            self.recycle_cond.notify_one();
            self.online.fetch_sub(1, Ordering::AcqRel);
        }
        newly
    }

    /// Recycle thread body. Sleeps until the earliest queued slot's
    /// cooldown elapses, releases everything due, and on shutdown drains
    /// the queue unconditionally.
    pub(crate) fn run_recycler(&self) {
        loop {
            let (due, done) = self.wait_for_due();
            for idx in due {
                self.release(idx);
            }
            if done {
                break;
            }
        }
    }

    pub(crate) fn shutdown_recycler(&self) {
        self.recycle.lock().shutdown = true;
        self.recycle_cond.notify_all();
    }

    fn wait_for_due(&self) -> (Vec<u32>, bool) {
        let mut set = self.recycle.lock();
        loop {
            if set.shutdown {
                let all: Vec<u32> = set.entries.drain().map(|(idx, _)| idx).collect();
                return (all, true);
            }
            if set.entries.is_empty() {
                self.recycle_cond.wait(&mut set);
                continue;
            }
            let now = Timestamp::now();
            let Some(earliest) = set.entries.values().min().copied() else {
                continue;
            };
            let due_at = earliest + self.recycle_wait;
            if due_at <= now {
                let due: Vec<u32> = set
                    .entries
                    .iter()
                    .filter(|(_, stamp)| **stamp + self.recycle_wait <= now)
                    .map(|(idx, _)| *idx)
                    .collect();
                for idx in &due {
                    set.entries.remove(idx);
                }
                return (due, false);
            }
            let timeout = due_at.duration_since(now);
            self.recycle_cond.wait_for(&mut set, timeout);
        }
    }

    /// Return a slot to the free list. Recycle path only.
    fn release(&self, idx: u32) {
        let Some(slot) = self.get(idx) else {
            return;
        };
        {
            let mut sock = slot.sock.lock();
            sock.stream = None;
            sock.inflight = None;
            sock.peer = None;
        }
        if slot.partial_writes.swap(0, Ordering::AcqRel) != 0 {
            tracing::warn!("slot {idx} released with a partial write still marked");
        }
        slot.queued_sends.store(0, Ordering::Release);
        slot.bump_generation();
        self.inner.lock().free.push(idx);
    }
}
