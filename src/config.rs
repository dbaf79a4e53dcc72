//! Engine configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;
use crate::frame::PKG_HEADER_SIZE;

/// Flood-detection tuning.
///
/// A connection that completes packets faster than `interval_ms` apart,
/// `kick_threshold` times in a row, is treated as abusive and force-closed.
#[derive(Clone, Debug)]
pub struct FloodConfig {
    /// Whether flood detection runs at all.
    pub enabled: bool,
    /// Minimum well-behaved gap between consecutive complete packets.
    pub interval_ms: u64,
    /// Consecutive too-fast packets tolerated before the kick.
    pub kick_threshold: u32,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 100,
            kick_threshold: 10,
        }
    }
}

/// Engine configuration.
///
/// Construct via [`ConfigBuilder`] or fill in fields directly and call
/// [`Config::validate`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Addresses to listen on. At least one is required to launch.
    pub listen: Vec<SocketAddr>,
    /// Listen backlog passed to the OS.
    pub backlog: i32,
    /// Maximum simultaneously online connections. Accepts beyond this are
    /// closed immediately.
    pub max_connections: u32,
    /// Pool-growth guard: once the slot arena has grown past
    /// `pool_growth_limit * max_connections` total slots, new accepts are
    /// rejected while fewer than `max_connections` slots are free. Protects
    /// against connect/close storms outrunning the recycle cooldown.
    pub pool_growth_limit: u32,
    /// Seconds a closed connection's slot rests in the recycle queue before
    /// returning to the free list.
    pub recycle_wait_secs: u64,
    /// Whether idle connections are evicted on a heartbeat deadline.
    pub idle_timeout_enabled: bool,
    /// Idle deadline, in seconds, armed at accept and pushed forward by
    /// [`EngineHandle::touch_timer`](crate::EngineHandle::touch_timer).
    pub idle_timeout_secs: u64,
    /// Flood-detection tuning.
    pub flood: FloodConfig,
    /// Worker threads for message dispatch. `0` means one per CPU.
    pub worker_threads: usize,
    /// Largest acceptable `pkg_len`, header included. Inbound headers
    /// declaring more resync the framer; outbound messages are bounded by
    /// the u16 length field regardless.
    pub max_packet_bytes: u32,
    /// Global cap on queued outbound messages. Excess messages are dropped.
    pub send_queue_capacity: usize,
    /// Per-connection cap on queued outbound messages. Exceeding it drops
    /// the message and force-closes the connection.
    pub send_backlog_per_conn: u32,
    /// Set `TCP_NODELAY` on accepted sockets.
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            backlog: 1024,
            max_connections: 1024,
            pool_growth_limit: 5,
            recycle_wait_secs: 60,
            idle_timeout_enabled: true,
            idle_timeout_secs: 60,
            flood: FloodConfig::default(),
            worker_threads: 0,
            max_packet_bytes: 30_000,
            send_queue_capacity: 50_000,
            send_backlog_per_conn: 400,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Validate the configuration, returning a setup error describing the
    /// first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Setup("max_connections must be nonzero".into()));
        }
        if self.max_connections > (1 << 20) {
            return Err(Error::Setup(
                "max_connections must be at most 2^20".into(),
            ));
        }
        if self.pool_growth_limit == 0 {
            return Err(Error::Setup("pool_growth_limit must be nonzero".into()));
        }
        if self.backlog <= 0 {
            return Err(Error::Setup("backlog must be positive".into()));
        }
        if (self.max_packet_bytes as usize) < PKG_HEADER_SIZE {
            return Err(Error::Setup(
                "max_packet_bytes must cover the packet header".into(),
            ));
        }
        if self.max_packet_bytes > u16::MAX as u32 {
            return Err(Error::Setup(
                "max_packet_bytes must fit the u16 length field".into(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(Error::Setup("send_queue_capacity must be nonzero".into()));
        }
        if self.send_backlog_per_conn == 0 {
            return Err(Error::Setup(
                "send_backlog_per_conn must be nonzero".into(),
            ));
        }
        if self.idle_timeout_enabled && self.idle_timeout_secs == 0 {
            return Err(Error::Setup(
                "idle_timeout_secs must be nonzero when eviction is enabled".into(),
            ));
        }
        if self.flood.enabled {
            if self.flood.interval_ms == 0 {
                return Err(Error::Setup(
                    "flood.interval_ms must be nonzero when flood detection is enabled".into(),
                ));
            }
            if self.flood.kick_threshold == 0 {
                return Err(Error::Setup(
                    "flood.kick_threshold must be nonzero when flood detection is enabled".into(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub(crate) fn recycle_wait(&self) -> Duration {
        Duration::from_secs(self.recycle_wait_secs)
    }

    pub(crate) fn flood_interval_micros(&self) -> i64 {
        (self.flood.interval_ms as i64).saturating_mul(1_000)
    }
}

/// Builder-style construction of a [`Config`].
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // ── Listeners ────────────────────────────────────────────────────────

    /// Add a listen address. May be called multiple times.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.config.listen.push(addr);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    // ── Connections ──────────────────────────────────────────────────────

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn pool_growth_limit(mut self, factor: u32) -> Self {
        self.config.pool_growth_limit = factor;
        self
    }

    pub fn recycle_wait_secs(mut self, secs: u64) -> Self {
        self.config.recycle_wait_secs = secs;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    // ── Idle eviction ────────────────────────────────────────────────────

    pub fn idle_timeout(mut self, enabled: bool) -> Self {
        self.config.idle_timeout_enabled = enabled;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.idle_timeout_secs = secs;
        self
    }

    // ── Flood detection ──────────────────────────────────────────────────

    pub fn flood_detection(mut self, enabled: bool) -> Self {
        self.config.flood.enabled = enabled;
        self
    }

    pub fn flood_interval_ms(mut self, ms: u64) -> Self {
        self.config.flood.interval_ms = ms;
        self
    }

    pub fn flood_kick_threshold(mut self, threshold: u32) -> Self {
        self.config.flood.kick_threshold = threshold;
        self
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    pub fn max_packet_bytes(mut self, bytes: u32) -> Self {
        self.config.max_packet_bytes = bytes;
        self
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    pub fn send_backlog_per_conn(mut self, cap: u32) -> Self {
        self.config.send_backlog_per_conn = cap;
        self
    }

    // ── Workers ──────────────────────────────────────────────────────────

    /// Worker threads for message dispatch. `0` means one per CPU.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────────

    /// Direct mutable access for options without a dedicated setter.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Validate and return the finished configuration.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn builder_round_trip() {
        let config = ConfigBuilder::new()
            .listen("127.0.0.1:9000".parse().unwrap())
            .max_connections(64)
            .pool_growth_limit(3)
            .idle_timeout(false)
            .flood_kick_threshold(5)
            .worker_threads(2)
            .build()
            .unwrap();
        assert_eq!(config.listen.len(), 1);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.pool_growth_limit, 3);
        assert!(!config.idle_timeout_enabled);
        assert_eq!(config.flood.kick_threshold, 5);
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn zero_max_connections_rejected() {
        let mut config = Config::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_packet_limit_rejected() {
        let mut config = Config::default();
        config.max_packet_bytes = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn packet_limit_below_header_rejected() {
        let mut config = Config::default();
        config.max_packet_bytes = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn flood_tuning_checked_only_when_enabled() {
        let mut config = Config::default();
        config.flood.enabled = true;
        config.flood.interval_ms = 0;
        assert!(config.validate().is_err());
        config.flood.enabled = false;
        assert!(config.validate().is_ok());
    }
}
