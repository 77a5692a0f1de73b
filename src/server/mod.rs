//! server — PageService: обработчик GetPage / StreamWAL / Ping поверх PageIndex и WAL applier'а.
//!
//! Разделение:
//! - mod.rs  — PageService (операции, жизненный цикл, фоновый компактор).
//! - http.rs — HTTP/JSON фронтенд на tiny_http (маршрутизация, /metrics, /health).
//!
//! GetPage:
//! - закрепляет запрошенный LSN (LsnPins) на время чтения;
//! - если lsn выше applied watermark — ждёт не дольше get_page_wait_ms, иначе NotApplied;
//! - отдаёт версию с наибольшим LSN <= lsn и её настоящий LSN.
//!
//! StreamWAL:
//! - валидирует payload до постановки в очередь (Malformed не попадает в applier);
//! - ack_mode=queued — ответ сразу после постановки; ack_mode=applied — ограниченное ожидание
//!   watermark. В обоих случаях отдаётся watermark на момент ответа.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::config::{AckMode, ServerConfig};
use crate::consts::PROTOCOL_VERSION;
use crate::error::PageError;
use crate::index::{CompactReport, IndexStats, LsnPins, PageIndex};
use crate::metrics::{
    record_compaction, record_get_page, record_get_page_not_applied, record_get_page_not_found,
    record_get_page_wait, record_ping, record_wal_malformed, record_wal_received,
};
use crate::page::{PageKey, PageVersion};
use crate::wal::{WalApplier, WalRecord, Watermark};

pub mod http;

pub use http::HttpServer;

/// Liveness info returned by Ping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub version: &'static str,
    pub last_applied_lsn: u64,
}

/// Horizon for compaction: readers at or above it must keep seeing the same versions.
pub fn compaction_horizon(watermark: u64, retain_window: u64, oldest_pin: Option<u64>) -> u64 {
    let by_window = watermark.saturating_sub(retain_window);
    match oldest_pin {
        Some(p) => by_window.min(p),
        None => by_window,
    }
}

struct Compactor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

/// The page service. Owns the index, the watermark and the applier thread.
pub struct PageService {
    cfg: ServerConfig,
    index: Arc<PageIndex>,
    watermark: Arc<Watermark>,
    pins: LsnPins,
    applier: WalApplier,
    compactor: Mutex<Option<Compactor>>,
    stopped: AtomicBool,
}

impl PageService {
    /// Validate the config, start the applier and (if enabled) the background compactor.
    pub fn start(cfg: ServerConfig) -> Result<Arc<Self>> {
        cfg.validate()?;

        let index = Arc::new(PageIndex::new(cfg.page_size));
        let watermark = Arc::new(Watermark::new());
        let applier = WalApplier::spawn(index.clone(), watermark.clone(), cfg.wal_queue_capacity)
            .map_err(|e| anyhow!("spawn WAL applier: {}", e))?;

        let svc = Arc::new(Self {
            cfg,
            index,
            watermark,
            pins: LsnPins::new(),
            applier,
            compactor: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        if svc.cfg.compact_interval_ms > 0 {
            let c = spawn_compactor(&svc)?;
            if let Ok(mut slot) = svc.compactor.lock() {
                *slot = Some(c);
            }
        }

        info!(
            "page service started: page_size={} ack_mode={} queue={}",
            svc.cfg.page_size, svc.cfg.ack_mode, svc.cfg.wal_queue_capacity
        );
        Ok(svc)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn index(&self) -> &PageIndex {
        &self.index
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn last_applied_lsn(&self) -> u64 {
        self.watermark.current()
    }

    /// Records accepted but not yet reflected in the watermark.
    pub fn pending_records(&self) -> usize {
        self.watermark.pending()
    }

    pub fn active_readers(&self) -> usize {
        self.pins.active()
    }

    /// Snapshot read of one page at `lsn`.
    pub fn get_page(&self, key: PageKey, lsn: u64) -> crate::error::Result<PageVersion> {
        record_get_page();
        let _pin = self.pins.pin(lsn);

        let mut applied = self.watermark.current();
        if lsn > applied {
            record_get_page_wait();
            applied = self.watermark.wait_for(lsn, self.cfg.get_page_wait());
            if applied < lsn {
                record_get_page_not_applied();
                debug!("get_page {}@{}: not applied (watermark {})", key, lsn, applied);
                return Err(PageError::NotApplied { lsn, applied });
            }
        }

        match self.index.get(key, lsn) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_not_found() {
                    record_get_page_not_found();
                }
                Err(e)
            }
        }
    }

    /// Several snapshot reads; one result per request, in order.
    pub fn get_pages(&self, reqs: &[(PageKey, u64)]) -> Vec<crate::error::Result<PageVersion>> {
        reqs.iter().map(|&(k, lsn)| self.get_page(k, lsn)).collect()
    }

    /// Accept one WAL record. Returns the watermark at acknowledgement time.
    ///
    /// With `legacy_key` set, `payload` is a raw page image for that key.
    pub fn stream_wal(
        &self,
        lsn: u64,
        payload: &[u8],
        legacy_key: Option<PageKey>,
    ) -> crate::error::Result<u64> {
        record_wal_received(payload.len());

        let decoded = match legacy_key {
            Some(key) => {
                let rec = WalRecord::single_image(lsn, key, payload.to_vec());
                rec.validate(self.cfg.page_size).map(|_| rec)
            }
            None => WalRecord::decode(lsn, payload, self.cfg.page_size),
        };
        let rec = match decoded {
            Ok(r) => r,
            Err(e) => {
                record_wal_malformed();
                warn!("stream_wal lsn={}: rejected: {}", lsn, e);
                return Err(e);
            }
        };

        self.applier.enqueue(rec, self.cfg.enqueue_wait())?;

        if self.cfg.ack_mode == AckMode::Applied {
            let seen = self.watermark.wait_for(lsn, self.cfg.ack_wait());
            if seen < lsn {
                debug!(
                    "stream_wal lsn={}: ack before apply (watermark {})",
                    lsn, seen
                );
            }
        }
        Ok(self.watermark.current())
    }

    pub fn ping(&self) -> ServiceInfo {
        record_ping();
        ServiceInfo {
            version: PROTOCOL_VERSION,
            last_applied_lsn: self.watermark.current(),
        }
    }

    /// One compaction pass at the current horizon.
    pub fn compact(&self) -> CompactReport {
        let h = compaction_horizon(
            self.watermark.current(),
            self.cfg.retain_lsn_window,
            self.pins.oldest(),
        );
        run_compaction(&self.index, h, &self.pins)
    }

    /// Stop the compactor, drain the applier queue and stop its thread. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let compactor = self.compactor.lock().ok().and_then(|mut c| c.take());
        if let Some(mut c) = compactor {
            let (lock, cv) = &*c.stop;
            if let Ok(mut stop) = lock.lock() {
                *stop = true;
            }
            cv.notify_all();
            if let Some(h) = c.handle.take() {
                let _ = h.join();
            }
        }
        self.applier.shutdown();
        info!(
            "page service stopped at watermark {}",
            self.watermark.current()
        );
    }
}

impl Drop for PageService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_compaction(index: &PageIndex, horizon: u64, pins: &LsnPins) -> CompactReport {
    let rep = index.compact_pinned(horizon, pins);
    record_compaction(rep.versions_dropped);
    rep
}

fn spawn_compactor(svc: &Arc<PageService>) -> Result<Compactor> {
    let stop = Arc::new((Mutex::new(false), Condvar::new()));
    let stop2 = stop.clone();
    let index = svc.index.clone();
    let watermark = svc.watermark.clone();
    let pins = svc.pins.clone();
    let window = svc.cfg.retain_lsn_window;
    let period = Duration::from_millis(svc.cfg.compact_interval_ms);

    let handle = thread::Builder::new()
        .name("qps-compactor".into())
        .spawn(move || {
            let (lock, cv) = &*stop2;
            loop {
                let Ok(guard) = lock.lock() else { return };
                let Ok((guard, _)) = cv.wait_timeout_while(guard, period, |stop| !*stop) else {
                    return;
                };
                if *guard {
                    return;
                }
                drop(guard);

                let h = compaction_horizon(watermark.current(), window, pins.oldest());
                let rep = run_compaction(&index, h, &pins);
                if rep.versions_dropped > 0 {
                    info!(
                        "compactor: horizon={} dropped {} version(s), freed {} bytes",
                        rep.horizon, rep.versions_dropped, rep.bytes_freed
                    );
                }
            }
        })
        .map_err(|e| anyhow!("spawn compactor: {}", e))?;

    Ok(Compactor {
        stop,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::PageOp;

    const PS: usize = 512;

    fn config() -> ServerConfig {
        ServerConfig::default()
            .with_page_size(PS)
            .with_compact_interval_ms(0)
            .with_get_page_wait_ms(2000)
    }

    fn service() -> Arc<PageService> {
        PageService::start(config()).unwrap()
    }

    fn write_payload(key: PageKey, offset: u32, bytes: &[u8]) -> Vec<u8> {
        WalRecord::new(
            0,
            vec![PageOp::Write {
                key,
                offset,
                bytes: bytes.to_vec(),
            }],
        )
        .encode_payload()
        .unwrap()
    }

    #[test]
    fn horizon_respects_window_and_pins() {
        assert_eq!(compaction_horizon(100, 10, None), 90);
        assert_eq!(compaction_horizon(100, 10, Some(50)), 50);
        assert_eq!(compaction_horizon(100, 10, Some(95)), 90);
        assert_eq!(compaction_horizon(5, 10, None), 0);
    }

    #[test]
    fn get_page_above_watermark_is_not_applied() {
        let svc = PageService::start(config().with_get_page_wait_ms(20)).unwrap();
        let err = svc.get_page(PageKey::new(1, 1), 10).unwrap_err();
        assert_eq!(err, PageError::NotApplied { lsn: 10, applied: 0 });
        svc.shutdown();
    }

    #[test]
    fn stream_then_get_returns_true_version_lsn() {
        let svc = service();
        let k = PageKey::new(1, 42);
        svc.stream_wal(1000, &write_payload(k, 0, b"D"), None).unwrap();

        let v = svc.get_page(k, 1000).unwrap();
        assert_eq!(v.lsn, 1000);
        assert_eq!(v.data[0], b'D');

        // higher request LSN still reports the stored version's LSN
        svc.stream_wal(1005, &WalRecord::new(1005, vec![]).encode_payload().unwrap(), None)
            .unwrap();
        assert_eq!(svc.get_page(k, 1005).unwrap().lsn, 1000);
        svc.shutdown();
    }

    #[test]
    fn malformed_wal_is_rejected_and_not_queued() {
        let svc = service();
        let err = svc.stream_wal(7, b"garbage", None).unwrap_err();
        assert!(matches!(err, PageError::Malformed(_)));
        assert_eq!(svc.pending_records(), 0);
        assert_eq!(svc.last_applied_lsn(), 0);
        svc.shutdown();
    }

    #[test]
    fn legacy_image_shorthand() {
        let svc = service();
        let k = PageKey::new(2, 3);
        svc.stream_wal(5, &[9u8; 16], Some(k)).unwrap();
        let v = svc.get_page(k, 5).unwrap();
        assert_eq!(&v.data[..16], &[9u8; 16]);
        assert!(v.data[16..].iter().all(|&b| b == 0));

        let too_big = svc.stream_wal(6, &vec![1u8; PS + 1], Some(k)).unwrap_err();
        assert!(matches!(too_big, PageError::Malformed(_)));
        svc.shutdown();
    }

    #[test]
    fn applied_ack_mode_reports_the_record() {
        let svc = PageService::start(config().with_ack_mode(AckMode::Applied)).unwrap();
        let k = PageKey::new(0, 1);
        let wm = svc.stream_wal(3, &write_payload(k, 0, b"x"), None).unwrap();
        assert_eq!(wm, 3);
        assert_eq!(svc.ping().last_applied_lsn, 3);
        svc.shutdown();
    }

    #[test]
    fn compact_keeps_pinned_versions() {
        let svc = PageService::start(config().with_retain_lsn_window(0)).unwrap();
        let k = PageKey::new(4, 4);
        for lsn in [10u64, 20, 30] {
            svc.stream_wal(lsn, &write_payload(k, 0, &[lsn as u8]), None)
                .unwrap();
        }
        assert_eq!(svc.get_page(k, 30).unwrap().lsn, 30);

        let pin = svc.pins.pin(10);
        let rep = svc.compact();
        assert_eq!(rep.horizon, 10);
        assert_eq!(rep.versions_dropped, 0);
        assert_eq!(svc.get_page(k, 10).unwrap().lsn, 10);
        drop(pin);

        let rep = svc.compact();
        assert_eq!(rep.horizon, 30);
        assert_eq!(rep.versions_dropped, 2);
        assert_eq!(svc.index().version_lsns(k).unwrap(), vec![30]);
        svc.shutdown();
    }
}
