//! Deadline scheduling.
//!
//! An array-backed binary min-heap keyed by [`Timestamp`], with stable
//! caller-visible handles so entries can be cancelled or rescheduled in
//! O(log n) from outside. A side table maps each handle to its current heap
//! position and is maintained across every swap.
//!
//! Not synchronized. The reactor thread is the only user.

use std::collections::HashMap;

use crate::clock::Timestamp;

/// Identifies one scheduled entry. Handles are never reused.
pub type TimerHandle = u64;

struct Entry<T> {
    deadline: Timestamp,
    handle: TimerHandle,
    payload: T,
}

/// Min-heap of deadlines carrying opaque payloads.
pub struct TimerHeap<T> {
    heap: Vec<Entry<T>>,
    index: HashMap<TimerHandle, usize>,
    next_handle: TimerHandle,
}

impl<T> TimerHeap<T> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The earliest pending deadline, if any.
    pub fn earliest(&self) -> Option<Timestamp> {
        self.heap.first().map(|e| e.deadline)
    }

    /// Schedule `payload` for `deadline`.
    pub fn add(&mut self, deadline: Timestamp, payload: T) -> TimerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let pos = self.heap.len();
        self.heap.push(Entry {
            deadline,
            handle,
            payload,
        });
        self.index.insert(handle, pos);
        self.sift_up(pos);
        handle
    }

    /// Move an entry to a new deadline. Returns false (and changes nothing)
    /// for an unknown handle.
    pub fn update(&mut self, handle: TimerHandle, deadline: Timestamp) -> bool {
        match self.index.get(&handle) {
            Some(&pos) => {
                self.heap[pos].deadline = deadline;
                self.fix_at(pos);
                true
            }
            None => false,
        }
    }

    /// Remove an entry. Returns false (and changes nothing) for an unknown
    /// handle.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.index.remove(&handle) {
            Some(pos) => {
                self.remove_at(pos);
                true
            }
            None => false,
        }
    }

    /// Pop the payload with the earliest deadline.
    pub fn pop_earliest(&mut self) -> Option<T> {
        let handle = self.heap.first()?.handle;
        self.index.remove(&handle);
        self.remove_at(0).map(|e| e.payload)
    }

    /// Pop the earliest payload only if its deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<T> {
        if self.earliest()? <= now {
            self.pop_earliest()
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Remove the entry at `pos`. The caller has already dropped its handle
    /// from the index.
    fn remove_at(&mut self, pos: usize) -> Option<Entry<T>> {
        let last = self.heap.len().checked_sub(1)?;
        self.heap.swap(pos, last);
        let entry = self.heap.pop()?;
        if pos < self.heap.len() {
            self.index.insert(self.heap[pos].handle, pos);
            self.fix_at(pos);
        }
        Some(entry)
    }

    /// Restore heap order for the entry at `pos`, sifting whichever
    /// direction the parent comparison demands.
    fn fix_at(&mut self, pos: usize) {
        if pos > 0 && self.heap[(pos - 1) / 2].deadline > self.heap[pos].deadline {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[parent].deadline <= self.heap[pos].deadline {
                break;
            }
            self.swap_entries(parent, pos);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < self.heap.len() && self.heap[right].deadline < self.heap[left].deadline {
                child = right;
            }
            if self.heap[pos].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_entries(pos, child);
            pos = child;
        }
    }

    fn swap_entries(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].handle, a);
        self.index.insert(self.heap[b].handle, b);
    }
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}
