//! Lightweight global metrics for QuiverPS.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Page service (GetPage / StreamWAL / Ping)
//! - WAL applier
//! - Compaction
//! - Remote client (retries, degraded StreamWAL)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Page service -----
static GET_PAGE_REQUESTS: AtomicU64 = AtomicU64::new(0);
static GET_PAGE_NOT_FOUND: AtomicU64 = AtomicU64::new(0);
static GET_PAGE_NOT_APPLIED: AtomicU64 = AtomicU64::new(0);
static GET_PAGE_WAITS: AtomicU64 = AtomicU64::new(0);
static PING_REQUESTS: AtomicU64 = AtomicU64::new(0);

// ----- WAL -----
static WAL_RECORDS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static WAL_BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static WAL_RECORDS_MALFORMED: AtomicU64 = AtomicU64::new(0);
static WAL_RECORDS_REJECTED: AtomicU64 = AtomicU64::new(0);
static WAL_RECORDS_APPLIED: AtomicU64 = AtomicU64::new(0);
static WAL_PAGES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static WAL_STALE_DISCARDS: AtomicU64 = AtomicU64::new(0);

// ----- Compaction -----
static COMPACTION_RUNS: AtomicU64 = AtomicU64::new(0);
static VERSIONS_COMPACTED: AtomicU64 = AtomicU64::new(0);

// ----- Client -----
static CLIENT_RETRIES: AtomicU64 = AtomicU64::new(0);
static CLIENT_RECONNECTS: AtomicU64 = AtomicU64::new(0);
static CLIENT_GET_PAGE_FAILURES: AtomicU64 = AtomicU64::new(0);
static CLIENT_WAL_DEGRADED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Page service
    pub get_page_requests: u64,
    pub get_page_not_found: u64,
    pub get_page_not_applied: u64,
    pub get_page_waits: u64,
    pub ping_requests: u64,

    // WAL
    pub wal_records_received: u64,
    pub wal_bytes_received: u64,
    pub wal_records_malformed: u64,
    pub wal_records_rejected: u64,
    pub wal_records_applied: u64,
    pub wal_pages_written: u64,
    pub wal_stale_discards: u64,

    // Compaction
    pub compaction_runs: u64,
    pub versions_compacted: u64,

    // Client
    pub client_retries: u64,
    pub client_reconnects: u64,
    pub client_get_page_failures: u64,
    pub client_wal_degraded: u64,
}

impl MetricsSnapshot {
    /// Share of GetPage requests that hit the bounded watermark wait.
    pub fn get_page_wait_ratio(&self) -> f64 {
        if self.get_page_requests == 0 {
            0.0
        } else {
            self.get_page_waits as f64 / self.get_page_requests as f64
        }
    }
}

// ----- Recorders (Page service) -----
pub fn record_get_page() {
    GET_PAGE_REQUESTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_get_page_not_found() {
    GET_PAGE_NOT_FOUND.fetch_add(1, Ordering::Relaxed);
}
pub fn record_get_page_not_applied() {
    GET_PAGE_NOT_APPLIED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_get_page_wait() {
    GET_PAGE_WAITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_ping() {
    PING_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (WAL) -----
pub fn record_wal_received(payload_len: usize) {
    WAL_RECORDS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    WAL_BYTES_RECEIVED.fetch_add(payload_len as u64, Ordering::Relaxed);
}
pub fn record_wal_malformed() {
    WAL_RECORDS_MALFORMED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_wal_rejected() {
    WAL_RECORDS_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_wal_applied(pages_written: u64) {
    WAL_RECORDS_APPLIED.fetch_add(1, Ordering::Relaxed);
    WAL_PAGES_WRITTEN.fetch_add(pages_written, Ordering::Relaxed);
}
pub fn record_wal_stale_discard() {
    WAL_STALE_DISCARDS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Compaction) -----
pub fn record_compaction(versions_dropped: u64) {
    COMPACTION_RUNS.fetch_add(1, Ordering::Relaxed);
    VERSIONS_COMPACTED.fetch_add(versions_dropped, Ordering::Relaxed);
}

// ----- Recorders (Client) -----
pub fn record_client_retry() {
    CLIENT_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_client_reconnect() {
    CLIENT_RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_client_get_page_failure() {
    CLIENT_GET_PAGE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_client_wal_degraded() {
    CLIENT_WAL_DEGRADED.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        get_page_requests: GET_PAGE_REQUESTS.load(Ordering::Relaxed),
        get_page_not_found: GET_PAGE_NOT_FOUND.load(Ordering::Relaxed),
        get_page_not_applied: GET_PAGE_NOT_APPLIED.load(Ordering::Relaxed),
        get_page_waits: GET_PAGE_WAITS.load(Ordering::Relaxed),
        ping_requests: PING_REQUESTS.load(Ordering::Relaxed),

        wal_records_received: WAL_RECORDS_RECEIVED.load(Ordering::Relaxed),
        wal_bytes_received: WAL_BYTES_RECEIVED.load(Ordering::Relaxed),
        wal_records_malformed: WAL_RECORDS_MALFORMED.load(Ordering::Relaxed),
        wal_records_rejected: WAL_RECORDS_REJECTED.load(Ordering::Relaxed),
        wal_records_applied: WAL_RECORDS_APPLIED.load(Ordering::Relaxed),
        wal_pages_written: WAL_PAGES_WRITTEN.load(Ordering::Relaxed),
        wal_stale_discards: WAL_STALE_DISCARDS.load(Ordering::Relaxed),

        compaction_runs: COMPACTION_RUNS.load(Ordering::Relaxed),
        versions_compacted: VERSIONS_COMPACTED.load(Ordering::Relaxed),

        client_retries: CLIENT_RETRIES.load(Ordering::Relaxed),
        client_reconnects: CLIENT_RECONNECTS.load(Ordering::Relaxed),
        client_get_page_failures: CLIENT_GET_PAGE_FAILURES.load(Ordering::Relaxed),
        client_wal_degraded: CLIENT_WAL_DEGRADED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    GET_PAGE_REQUESTS.store(0, Ordering::Relaxed);
    GET_PAGE_NOT_FOUND.store(0, Ordering::Relaxed);
    GET_PAGE_NOT_APPLIED.store(0, Ordering::Relaxed);
    GET_PAGE_WAITS.store(0, Ordering::Relaxed);
    PING_REQUESTS.store(0, Ordering::Relaxed);

    WAL_RECORDS_RECEIVED.store(0, Ordering::Relaxed);
    WAL_BYTES_RECEIVED.store(0, Ordering::Relaxed);
    WAL_RECORDS_MALFORMED.store(0, Ordering::Relaxed);
    WAL_RECORDS_REJECTED.store(0, Ordering::Relaxed);
    WAL_RECORDS_APPLIED.store(0, Ordering::Relaxed);
    WAL_PAGES_WRITTEN.store(0, Ordering::Relaxed);
    WAL_STALE_DISCARDS.store(0, Ordering::Relaxed);

    COMPACTION_RUNS.store(0, Ordering::Relaxed);
    VERSIONS_COMPACTED.store(0, Ordering::Relaxed);

    CLIENT_RETRIES.store(0, Ordering::Relaxed);
    CLIENT_RECONNECTS.store(0, Ordering::Relaxed);
    CLIENT_GET_PAGE_FAILURES.store(0, Ordering::Relaxed);
    CLIENT_WAL_DEGRADED.store(0, Ordering::Relaxed);
}
