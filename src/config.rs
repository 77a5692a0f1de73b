//! Centralized configuration for the page service and the remote page client.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - ServerConfig::from_env() / ClientConfig::from_env() read QPS_* variables over defaults.
//! - Fluent with_* setters for tests and embedding code; the daemon layers CLI/TOML on top.
//!
//! Defaults follow the page-server deployment this was built for:
//! - 16 KiB pages, HTTP on :8080
//! - client: connect 5s, read 10s, 2 retries with 100 ms doubling backoff
//! - server: bounded 100 ms wait for the applied watermark on GetPage

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::consts::{DEFAULT_PAGE_SIZE, DEFAULT_PORT};
use crate::page::validate_page_size;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// When StreamWAL is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// As soon as the record sits in the applier's ordered queue.
    Queued,
    /// After the watermark reaches the record (bounded by `ack_wait_ms`).
    Applied,
}

impl FromStr for AckMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" | "" => Ok(AckMode::Queued),
            "applied" => Ok(AckMode::Applied),
            other => Err(anyhow!("invalid ack mode '{}': use queued|applied", other)),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Queued => f.write_str("queued"),
            AckMode::Applied => f.write_str("applied"),
        }
    }
}

/// `now + d`, saturating to a far-off instant when `d` is absurdly large.
pub(crate) fn deadline_in(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ~30 years
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

// ------------------------------------------------------------------------------------------------
// Server
// ------------------------------------------------------------------------------------------------

/// Page service configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address. Env: QPS_LISTEN (default 0.0.0.0:8080)
    pub listen: String,

    /// Page size in bytes. Env: QPS_PAGE_SIZE (default 16384)
    pub page_size: usize,

    /// HTTP worker threads. Env: QPS_HTTP_WORKERS (default 4)
    pub http_workers: usize,

    /// Bounded wait for the applied watermark on GetPage.
    /// Env: QPS_GET_PAGE_WAIT_MS (default 100)
    pub get_page_wait_ms: u64,

    /// Applier queue capacity (records). Env: QPS_WAL_QUEUE_CAPACITY (default 65536)
    pub wal_queue_capacity: usize,

    /// How long StreamWAL may wait for queue space. Env: QPS_ENQUEUE_WAIT_MS (default 1000)
    pub enqueue_wait_ms: u64,

    /// Env: QPS_ACK_MODE = queued|applied (default queued)
    pub ack_mode: AckMode,

    /// Bound on the `applied` acknowledgement wait. Env: QPS_ACK_WAIT_MS (default 1000)
    pub ack_wait_ms: u64,

    /// Background compaction period, 0 disables. Env: QPS_COMPACT_INTERVAL_MS (default 10000)
    pub compact_interval_ms: u64,

    /// Versions newer than watermark - window are always kept.
    /// Env: QPS_RETAIN_LSN_WINDOW (default 64 MiB of LSN)
    pub retain_lsn_window: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            page_size: DEFAULT_PAGE_SIZE,
            http_workers: 4,
            get_page_wait_ms: 100,
            wal_queue_capacity: 65_536,
            enqueue_wait_ms: 1000,
            ack_mode: AckMode::Queued,
            ack_wait_ms: 1000,
            compact_interval_ms: 10_000,
            retain_lsn_window: 64 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from QPS_* environment variables over defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_string("QPS_LISTEN") {
            cfg.listen = v;
        }
        if let Some(n) = env_usize("QPS_PAGE_SIZE") {
            cfg.page_size = n;
        }
        if let Some(n) = env_usize("QPS_HTTP_WORKERS") {
            cfg.http_workers = n;
        }
        if let Some(n) = env_u64("QPS_GET_PAGE_WAIT_MS") {
            cfg.get_page_wait_ms = n;
        }
        if let Some(n) = env_usize("QPS_WAL_QUEUE_CAPACITY") {
            cfg.wal_queue_capacity = n;
        }
        if let Some(n) = env_u64("QPS_ENQUEUE_WAIT_MS") {
            cfg.enqueue_wait_ms = n;
        }
        if let Some(v) = env_string("QPS_ACK_MODE") {
            // Невалидное значение не роняет процесс: остаётся default.
            if let Ok(m) = v.parse::<AckMode>() {
                cfg.ack_mode = m;
            }
        }
        if let Some(n) = env_u64("QPS_ACK_WAIT_MS") {
            cfg.ack_wait_ms = n;
        }
        if let Some(n) = env_u64("QPS_COMPACT_INTERVAL_MS") {
            cfg.compact_interval_ms = n;
        }
        if let Some(n) = env_u64("QPS_RETAIN_LSN_WINDOW") {
            cfg.retain_lsn_window = n;
        }

        cfg
    }

    pub fn with_listen<S: Into<String>>(mut self, addr: S) -> Self {
        self.listen = addr.into();
        self
    }

    pub fn with_page_size(mut self, ps: usize) -> Self {
        self.page_size = ps;
        self
    }

    pub fn with_http_workers(mut self, n: usize) -> Self {
        self.http_workers = n;
        self
    }

    pub fn with_get_page_wait_ms(mut self, ms: u64) -> Self {
        self.get_page_wait_ms = ms;
        self
    }

    pub fn with_wal_queue_capacity(mut self, n: usize) -> Self {
        self.wal_queue_capacity = n;
        self
    }

    pub fn with_enqueue_wait_ms(mut self, ms: u64) -> Self {
        self.enqueue_wait_ms = ms;
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_ack_wait_ms(mut self, ms: u64) -> Self {
        self.ack_wait_ms = ms;
        self
    }

    pub fn with_compact_interval_ms(mut self, ms: u64) -> Self {
        self.compact_interval_ms = ms;
        self
    }

    pub fn with_retain_lsn_window(mut self, w: u64) -> Self {
        self.retain_lsn_window = w;
        self
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !validate_page_size(self.page_size) {
            return Err(anyhow!(
                "invalid page_size {} (power of two in 512..=65536)",
                self.page_size
            ));
        }
        if self.http_workers == 0 {
            return Err(anyhow!("http_workers must be >= 1"));
        }
        if self.wal_queue_capacity == 0 {
            return Err(anyhow!("wal_queue_capacity must be >= 1"));
        }
        Ok(())
    }

    #[inline]
    pub fn get_page_wait(&self) -> Duration {
        Duration::from_millis(self.get_page_wait_ms)
    }

    #[inline]
    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }

    #[inline]
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerConfig {{ \
             listen: {}, \
             page_size: {}, \
             http_workers: {}, \
             get_page_wait_ms: {}, \
             wal_queue_capacity: {}, \
             enqueue_wait_ms: {}, \
             ack_mode: {}, \
             ack_wait_ms: {}, \
             compact_interval_ms: {}, \
             retain_lsn_window: {} \
             }}",
            self.listen,
            self.page_size,
            self.http_workers,
            self.get_page_wait_ms,
            self.wal_queue_capacity,
            self.enqueue_wait_ms,
            self.ack_mode,
            self.ack_wait_ms,
            if self.compact_interval_ms == 0 {
                "off".to_string()
            } else {
                self.compact_interval_ms.to_string()
            },
            self.retain_lsn_window,
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Client
// ------------------------------------------------------------------------------------------------

/// Remote page client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// "host[:port]"; None keeps the client disabled. Env: QPS_ADDRESS
    pub address: Option<String>,

    /// Expected page size; decoded pages of another length are malformed.
    /// Env: QPS_PAGE_SIZE (default 16384)
    pub page_size: usize,

    /// Env: QPS_CONNECT_TIMEOUT_MS (default 5000)
    pub connect_timeout_ms: u64,

    /// Per-read/write socket timeout. Env: QPS_IO_TIMEOUT_MS (default 10000)
    pub io_timeout_ms: u64,

    /// Retries after the first attempt. Env: QPS_MAX_RETRIES (default 2)
    pub max_retries: u32,

    /// Env: QPS_BACKOFF_BASE_MS (default 100)
    pub backoff_base_ms: u64,

    /// Env: QPS_BACKOFF_CAP_MS (default 1000)
    pub backoff_cap_ms: u64,

    /// Overall deadline for GetPage/Ping. Env: QPS_REQUEST_DEADLINE_MS (default 15000)
    pub request_deadline_ms: u64,

    /// Overall deadline for StreamWAL before degrading. Env: QPS_WAL_DEADLINE_MS (default 2000)
    pub wal_deadline_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: None,
            page_size: DEFAULT_PAGE_SIZE,
            connect_timeout_ms: 5000,
            io_timeout_ms: 10_000,
            max_retries: 2,
            backoff_base_ms: 100,
            backoff_cap_ms: 1000,
            request_deadline_ms: 15_000,
            wal_deadline_ms: 2000,
        }
    }
}

impl ClientConfig {
    /// Load configuration from QPS_* environment variables over defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.address = env_string("QPS_ADDRESS");
        if let Some(n) = env_usize("QPS_PAGE_SIZE") {
            cfg.page_size = n;
        }
        if let Some(n) = env_u64("QPS_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout_ms = n;
        }
        if let Some(n) = env_u64("QPS_IO_TIMEOUT_MS") {
            cfg.io_timeout_ms = n;
        }
        if let Some(n) = env_u64("QPS_MAX_RETRIES") {
            cfg.max_retries = n.min(u32::MAX as u64) as u32;
        }
        if let Some(n) = env_u64("QPS_BACKOFF_BASE_MS") {
            cfg.backoff_base_ms = n;
        }
        if let Some(n) = env_u64("QPS_BACKOFF_CAP_MS") {
            cfg.backoff_cap_ms = n;
        }
        if let Some(n) = env_u64("QPS_REQUEST_DEADLINE_MS") {
            cfg.request_deadline_ms = n;
        }
        if let Some(n) = env_u64("QPS_WAL_DEADLINE_MS") {
            cfg.wal_deadline_ms = n;
        }

        cfg
    }

    /// Shorthand for `ClientConfig::default().with_address(Some(addr))`.
    pub fn for_address<S: Into<String>>(addr: S) -> Self {
        Self::default().with_address(Some(addr))
    }

    pub fn with_address<S: Into<String>>(mut self, addr: Option<S>) -> Self {
        self.address = addr.map(Into::into);
        self
    }

    pub fn with_page_size(mut self, ps: usize) -> Self {
        self.page_size = ps;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_io_timeout_ms(mut self, ms: u64) -> Self {
        self.io_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_backoff_ms(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }

    pub fn with_request_deadline_ms(mut self, ms: u64) -> Self {
        self.request_deadline_ms = ms;
        self
    }

    pub fn with_wal_deadline_ms(mut self, ms: u64) -> Self {
        self.wal_deadline_ms = ms;
        self
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    #[inline]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    #[inline]
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    #[inline]
    pub fn wal_deadline(&self) -> Duration {
        Duration::from_millis(self.wal_deadline_ms)
    }
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientConfig {{ \
             address: {}, \
             page_size: {}, \
             connect_timeout_ms: {}, \
             io_timeout_ms: {}, \
             max_retries: {}, \
             backoff: {}..{} ms, \
             request_deadline_ms: {}, \
             wal_deadline_ms: {} \
             }}",
            self.address.as_deref().unwrap_or("disabled"),
            self.page_size,
            self.connect_timeout_ms,
            self.io_timeout_ms,
            self.max_retries,
            self.backoff_base_ms,
            self.backoff_cap_ms,
            self.request_deadline_ms,
            self.wal_deadline_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_mode_parses_case_insensitive() {
        assert_eq!("Applied".parse::<AckMode>().unwrap(), AckMode::Applied);
        assert_eq!("queued".parse::<AckMode>().unwrap(), AckMode::Queued);
        assert!("sync".parse::<AckMode>().is_err());
    }

    #[test]
    fn server_validate_rejects_odd_page_size() {
        let cfg = ServerConfig::default().with_page_size(3000);
        assert!(cfg.validate().is_err());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn client_defaults_are_disabled() {
        let cfg = ClientConfig::default();
        assert!(cfg.address.is_none());
        assert_eq!(cfg.max_retries, 2);
        let cfg = ClientConfig::for_address("127.0.0.1:9");
        assert_eq!(cfg.address.as_deref(), Some("127.0.0.1:9"));
    }
}
