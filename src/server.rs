//! Engine assembly and runtime surface.
//!
//! [`PacklineBuilder`] validates configuration, binds listeners, and starts
//! the engine threads. Applications implement [`EventHandler`] and interact
//! with a running engine through [`EngineHandle`].

use std::io;
use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use mio::net::TcpListener;
use mio::{Interest, Poll, Registry, Token, Waker};

use crate::clock::Timestamp;
use crate::config::Config;
use crate::connection::ConnectionPool;
use crate::error::Error;
use crate::frame::{ConnToken, Delivery, OutboundMessage};
use crate::metrics;
use crate::reactor::{Reactor, WAKER_TOKEN};
use crate::sender::{self, OutboundEntry, SendQueue};
use crate::workers::WorkerPool;

/// Implemented by the application to receive engine events.
pub trait EventHandler: Send + Sync + 'static {
    /// Called on a worker thread for every complete, checksum-valid message.
    ///
    /// Calls for one connection are serialized; calls for different
    /// connections run concurrently.
    fn on_message(&self, ctx: &EngineHandle, delivery: Delivery);

    /// Called on the reactor thread when a connection's idle deadline
    /// expires. Return `true` to evict the connection, `false` to re-arm
    /// the deadline one idle interval from `now`. Keep this quick; the
    /// reactor is paused while it runs.
    fn on_ping_timeout(&self, ctx: &EngineHandle, token: ConnToken, now: Timestamp) -> bool {
        let _ = (ctx, token, now);
        true
    }
}

/// Commands other threads hand to the reactor, paired with a waker nudge.
pub(crate) enum ReactorCmd {
    TouchTimer { token: ConnToken, deadline: Timestamp },
    Close { token: ConnToken },
}

/// State shared by every engine thread.
pub(crate) struct EngineShared {
    pub(crate) config: Config,
    pub(crate) pool: ConnectionPool,
    pub(crate) outbound: SendQueue,
    pub(crate) workers: WorkerPool,
    pub(crate) registry: Registry,
    pub(crate) waker: Waker,
    pub(crate) cmd_tx: Sender<ReactorCmd>,
    pub(crate) handler: Arc<dyn EventHandler>,
    shutdown: AtomicBool,
    conn_base: usize,
}

impl EngineShared {
    /// Poll token for a connection slot.
    pub(crate) fn conn_token(&self, slot: u32) -> Token {
        Token(self.conn_base + slot as usize)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Cloneable handle for interacting with a running engine.
///
/// Handed to [`EventHandler`] callbacks and returned from launch; safe to
/// use from any thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

impl EngineHandle {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Queue a message for asynchronous delivery.
    ///
    /// Messages for stale or unknown connections are dropped, as are
    /// messages over the global queue cap. A connection whose own backlog
    /// exceeds the per-connection cap is disconnected. All drops are
    /// counted, not surfaced as errors; the wire offers no delivery
    /// guarantee either way.
    pub fn send(&self, msg: OutboundMessage) {
        let token = msg.token();
        let Some(slot) = self.shared.pool.get(token.slot()) else {
            metrics::SEND_STALE_DROPPED.increment();
            return;
        };
        if !slot.is_current(token) {
            metrics::SEND_STALE_DROPPED.increment();
            return;
        }
        if slot.queued_sends.load(Ordering::Acquire) > self.shared.config.send_backlog_per_conn {
            // A peer that cannot drain its own traffic gets disconnected.
            metrics::SEND_DISCARDED.increment();
            self.request_close(token);
            return;
        }
        self.shared.outbound.enqueue(OutboundEntry { msg, slot });
    }

    /// Reschedule a connection's idle deadline.
    ///
    /// Typical use is pushing the deadline forward when a heartbeat
    /// arrives. No-op when the connection is gone, or when idle eviction
    /// is disabled and no deadline is armed.
    pub fn touch_timer(&self, token: ConnToken, deadline: Timestamp) {
        let _ = self
            .shared
            .cmd_tx
            .send(ReactorCmd::TouchTimer { token, deadline });
        let _ = self.shared.waker.wake();
    }

    /// Connections currently online.
    pub fn online(&self) -> i64 {
        self.shared.pool.online()
    }

    fn request_close(&self, token: ConnToken) {
        let _ = self.shared.cmd_tx.send(ReactorCmd::Close { token });
        let _ = self.shared.waker.wake();
    }
}

/// Stops a running engine.
pub struct ShutdownHandle {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle").finish_non_exhaustive()
    }
}

impl ShutdownHandle {
    /// Signal every engine thread to stop. Idempotent, returns without
    /// waiting; join the handles from launch to wait for teardown.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }
}

/// Successful launch: the runtime handle, the stop handle, and the engine
/// threads to join after shutdown.
pub type LaunchResult = Result<(EngineHandle, ShutdownHandle, Vec<JoinHandle<Result<(), Error>>>), Error>;

/// Configures and launches an engine.
pub struct PacklineBuilder {
    config: Config,
}

impl PacklineBuilder {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Add a listen address on top of any already in the config.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.listen.push(addr);
        self
    }

    /// Validate the configuration, bind every listener, and start the
    /// engine threads.
    pub fn launch<H: EventHandler>(self, handler: H) -> LaunchResult {
        self.config.validate()?;
        if self.config.listen.is_empty() {
            return Err(Error::Setup("no listen address configured".into()));
        }
        ensure_nofile_limit(&self.config)?;

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let mut listeners = Vec::with_capacity(self.config.listen.len());
        for addr in &self.config.listen {
            listeners.push(create_listener(*addr, self.config.backlog)?);
        }
        for (i, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, Token(i), Interest::READABLE)?;
        }
        let conn_base = listeners.len();

        let (cmd_tx, cmd_rx) = unbounded();
        let shared = Arc::new(EngineShared {
            pool: ConnectionPool::new(&self.config),
            outbound: SendQueue::new(self.config.send_queue_capacity),
            workers: WorkerPool::new(self.config.worker_threads)?,
            registry,
            waker,
            cmd_tx,
            handler: Arc::new(handler),
            shutdown: AtomicBool::new(false),
            conn_base,
            config: self.config,
        });

        let mut threads: Vec<JoinHandle<Result<(), Error>>> = Vec::with_capacity(3);
        {
            let shared = shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("packline-send".to_string())
                    .spawn(move || sender::run(shared))?,
            );
        }
        {
            let shared = shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("packline-recycle".to_string())
                    .spawn(move || {
                        shared.pool.run_recycler();
                        Ok(())
                    })?,
            );
        }
        {
            let shared = shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("packline-reactor".to_string())
                    .spawn(move || Reactor::new(poll, listeners, cmd_rx, shared).run())?,
            );
        }

        let engine = EngineHandle::new(shared.clone());
        let shutdown = ShutdownHandle { shared };
        Ok((engine, shutdown, threads))
    }
}

/// Create a nonblocking listening socket bound to `addr`.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(close_on_error(fd));
    }
    let rc = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    // octets() is already network order; keep the bytes.
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if rc != 0 {
        return Err(close_on_error(fd));
    }
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(close_on_error(fd));
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn close_on_error(fd: libc::c_int) -> Error {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    err.into()
}

/// Ensure the process may open enough file descriptors for the configured
/// connection load, raising the soft limit when the hard limit allows.
fn ensure_nofile_limit(config: &Config) -> Result<(), Error> {
    // A socket per steady-state slot, the listeners, the waker, and
    // headroom for stdio and friends.
    let required = config.max_connections as u64 + config.listen.len() as u64 + 64;
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    if limit.rlim_cur >= required {
        return Ok(());
    }
    if limit.rlim_max < required {
        return Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE hard limit is {}, need {}",
            limit.rlim_max, required
        )));
    }
    limit.rlim_cur = required;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
