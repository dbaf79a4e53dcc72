//! Worker thread pool.
//!
//! Messages are dispatched off the reactor onto a fixed set of worker
//! threads. Tasks run in FIFO submission order; completion order across
//! threads is unspecified. A panicking task is contained to itself: the
//! worker survives and, for [`WorkerPool::submit`], the panic is reported
//! through the returned future.

use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::Error as EngineError;

/// Returned by [`TaskFuture::wait`] when the task panicked, or when the
/// pool was stopped before the task could run.
#[derive(Debug, Error)]
#[error("worker task failed: {0}")]
pub struct TaskPanicked(String);

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    /// Queued plus currently running tasks.
    total: usize,
    running: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    task_available: Condvar,
    all_done: Condvar,
}

enum FutureSlot<R> {
    Pending,
    Done(R),
    Failed(String),
}

struct FutureInner<R> {
    slot: Mutex<FutureSlot<R>>,
    ready: Condvar,
}

/// Completion handle for a task submitted with [`WorkerPool::submit`].
pub struct TaskFuture<R> {
    inner: Arc<FutureInner<R>>,
}

impl<R> TaskFuture<R> {
    /// Block until the task finishes.
    pub fn wait(self) -> Result<R, TaskPanicked> {
        let mut slot = self.inner.slot.lock();
        loop {
            match mem::replace(&mut *slot, FutureSlot::Pending) {
                FutureSlot::Done(value) => return Ok(value),
                FutureSlot::Failed(msg) => return Err(TaskPanicked(msg)),
                FutureSlot::Pending => self.inner.ready.wait(&mut slot),
            }
        }
    }
}

/// Fixed-size pool of task-running threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn a pool with `threads` workers. `0` means one per CPU.
    pub fn new(threads: usize) -> Result<Self, EngineError> {
        let count = if threads == 0 { num_cpus() } else { threads };
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                total: 0,
                running: true,
            }),
            task_available: Condvar::new(),
            all_done: Condvar::new(),
        });
        let handles = spawn_workers(&shared, count)?;
        Ok(Self {
            shared,
            threads: Mutex::new(handles),
        })
    }

    /// Queue a fire-and-forget task. Dropped silently if the pool has been
    /// stopped.
    pub fn push_task<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f));
    }

    /// Queue a task and return a future for its result.
    pub fn submit<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::new(FutureInner {
            slot: Mutex::new(FutureSlot::Pending),
            ready: Condvar::new(),
        });
        let task_inner = inner.clone();
        let accepted = self.enqueue(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            let mut slot = task_inner.slot.lock();
            *slot = match outcome {
                Ok(value) => FutureSlot::Done(value),
                Err(payload) => FutureSlot::Failed(panic_message(payload.as_ref())),
            };
            task_inner.ready.notify_all();
        }));
        if !accepted {
            let mut slot = inner.slot.lock();
            *slot = FutureSlot::Failed("worker pool is stopped".into());
            inner.ready.notify_all();
        }
        TaskFuture { inner }
    }

    /// Block until every queued and running task has finished. Safe to call
    /// from any number of threads at once; each caller returns once the
    /// queue has been empty at some instant after it started waiting.
    pub fn wait_for_tasks(&self) {
        let mut state = self.shared.state.lock();
        while state.total != 0 {
            self.shared.all_done.wait(&mut state);
        }
    }

    /// Wait for the queue to drain, then replace the workers with `threads`
    /// fresh ones (`0` means one per CPU).
    pub fn reset(&self, threads: usize) -> Result<(), EngineError> {
        self.wait_for_tasks();
        self.stop_workers();
        let count = if threads == 0 { num_cpus() } else { threads };
        self.shared.state.lock().running = true;
        let handles = spawn_workers(&self.shared, count)?;
        *self.threads.lock() = handles;
        Ok(())
    }

    /// Drain outstanding tasks, then stop and join every worker.
    pub fn shutdown(&self) {
        self.wait_for_tasks();
        self.stop_workers();
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Returns false if the pool is stopped and the task was dropped.
    fn enqueue(&self, task: Task) -> bool {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return false;
            }
            state.tasks.push_back(task);
            state.total += 1;
        }
        self.shared.task_available.notify_one();
        true
    }

    fn stop_workers(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
        }
        self.shared.task_available.notify_all();
        let old = mem::take(&mut *self.threads.lock());
        for handle in old {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn spawn_workers(shared: &Arc<Shared>, count: usize) -> Result<Vec<JoinHandle<()>>, EngineError> {
    let mut handles = Vec::with_capacity(count);
    for id in 0..count {
        let shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("packline-worker-{id}"))
            .spawn(move || worker_loop(shared))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break Some(task);
                }
                if !state.running {
                    break None;
                }
                shared.task_available.wait(&mut state);
            }
        };
        let Some(task) = next else { break };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            tracing::error!(
                "worker task panicked: {}",
                panic_message(payload.as_ref())
            );
        }
        let mut state = shared.state.lock();
        state.total -= 1;
        if state.total == 0 {
            shared.all_done.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn num_cpus() -> usize {
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if cpus < 1 {
        1
    } else {
        cpus as usize
    }
}
