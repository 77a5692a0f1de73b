//! wal/applier — фоновое применение WAL-записей к PageIndex.
//!
//! Конвейер:
//! - enqueue(): запись регистрируется в Watermark и кладётся в упорядоченную очередь
//!   (BTreeMap по LSN). Очередь ограничена; при переполнении производитель ждёт
//!   не дольше заданного таймаута.
//! - поток applier'а забирает всю очередь целиком и применяет записи по возрастанию LSN;
//!   после каждой записи — Watermark::resolve(lsn).
//!
//! Для каждого затронутого ключа последняя версия (или нулевая страница) берётся как база,
//! к ней применяются операции записи в порядке payload, результат уходит в PageIndex::put.
//! Если у ключа уже есть версия с LSN >= записи — это повторная или запоздавшая доставка:
//! ключ пропускается как no-op (StaleWrite не является ошибкой).
//!
//! Applier — единственный писатель версий, поэтому latest() + put() по одному ключу не гоняются.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::deadline_in;
use crate::error::{PageError, Result};
use crate::index::PageIndex;
use crate::metrics::{record_wal_applied, record_wal_rejected, record_wal_stale_discard};
use crate::page::zero_page;

use super::record::WalRecord;
use super::watermark::Watermark;

/// Result of applying one record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Keys that received a new version.
    pub pages_written: u64,
    /// Keys skipped because a version at or above the record's LSN already existed.
    pub stale_keys: u64,
    /// Keys that failed for another reason (reported, not fatal).
    pub failed_keys: u64,
}

/// Apply one decoded record to the index. Callers must be the key's only writer.
pub fn apply_record(index: &PageIndex, rec: &WalRecord) -> ApplyOutcome {
    let mut out = ApplyOutcome::default();
    let ps = index.page_size();

    for key in rec.affected_keys() {
        let latest = match index.latest(key) {
            Ok(v) => v,
            Err(e) => {
                warn!("apply lsn={}: read latest {} failed: {}", rec.lsn, key, e);
                out.failed_keys += 1;
                continue;
            }
        };
        if let Some(v) = &latest {
            if v.lsn >= rec.lsn {
                debug!(
                    "apply lsn={}: {} already at lsn {}, discard",
                    rec.lsn, key, v.lsn
                );
                record_wal_stale_discard();
                out.stale_keys += 1;
                continue;
            }
        }

        let mut page = match latest {
            Some(v) => v.data.to_vec(),
            None => zero_page(ps),
        };
        for op in rec.ops_for(key) {
            op.apply_to(&mut page);
        }

        match index.put(key, rec.lsn, page) {
            Ok(()) => out.pages_written += 1,
            Err(PageError::StaleWrite { current, .. }) => {
                debug!(
                    "apply lsn={}: {} superseded by lsn {}, discard",
                    rec.lsn, key, current
                );
                record_wal_stale_discard();
                out.stale_keys += 1;
            }
            Err(e) => {
                warn!("apply lsn={}: put {} failed: {}", rec.lsn, key, e);
                out.failed_keys += 1;
            }
        }
    }

    out
}

struct QueueState {
    records: BTreeMap<u64, Vec<WalRecord>>,
    // queued + taken by the applier but not yet applied
    len: usize,
    shutdown: bool,
}

struct Shared {
    index: Arc<PageIndex>,
    watermark: Arc<Watermark>,
    capacity: usize,
    queue: Mutex<QueueState>,
    cv_work: Condvar,
    cv_space: Condvar,
}

/// Background WAL applier with a bounded, LSN-ordered queue.
pub struct WalApplier {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WalApplier {
    /// Start the applier thread.
    pub fn spawn(
        index: Arc<PageIndex>,
        watermark: Arc<Watermark>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            index,
            watermark,
            capacity: capacity.max(1),
            queue: Mutex::new(QueueState {
                records: BTreeMap::new(),
                len: 0,
                shutdown: false,
            }),
            cv_work: Condvar::new(),
            cv_space: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("qps-applier".into())
            .spawn(move || run_loop(&worker))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a validated record, waiting at most `wait` for space.
    pub fn enqueue(&self, rec: WalRecord, wait: Duration) -> Result<()> {
        let deadline = deadline_in(wait);
        let mut q = self
            .shared
            .queue
            .lock()
            .map_err(|_| PageError::unavailable("apply queue poisoned"))?;
        while q.len >= self.shared.capacity && !q.shutdown {
            let now = Instant::now();
            if now >= deadline {
                record_wal_rejected();
                return Err(PageError::unavailable(format!(
                    "WAL apply queue full ({} records)",
                    self.shared.capacity
                )));
            }
            q = self
                .shared
                .cv_space
                .wait_timeout(q, deadline - now)
                .map_err(|_| PageError::unavailable("apply queue poisoned"))?
                .0;
        }
        if q.shutdown {
            record_wal_rejected();
            return Err(PageError::unavailable("WAL applier is shutting down"));
        }

        // регистрация под локом очереди: applier не увидит запись раньше, чем watermark о ней узнает
        self.shared.watermark.register(rec.lsn);
        q.records.entry(rec.lsn).or_default().push(rec);
        q.len += 1;
        drop(q);
        self.shared.cv_work.notify_one();
        Ok(())
    }

    /// Records accepted and not yet applied (including the batch being applied now).
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().map(|q| q.len).unwrap_or(0)
    }

    /// Drain the queue and stop the thread. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut q) = self.shared.queue.lock() {
            q.shutdown = true;
        }
        self.shared.cv_work.notify_all();
        self.shared.cv_space.notify_all();

        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(h) = handle {
            if h.join().is_err() {
                warn!("WAL applier thread panicked");
            }
        }
    }
}

impl Drop for WalApplier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: &Shared) {
    debug!("WAL applier started (capacity {})", shared.capacity);
    loop {
        let batch = {
            let Ok(mut q) = shared.queue.lock() else {
                warn!("WAL applier: queue poisoned, stopping");
                return;
            };
            while q.records.is_empty() && !q.shutdown {
                q = match shared.cv_work.wait(q) {
                    Ok(g) => g,
                    Err(_) => return,
                };
            }
            if q.records.is_empty() && q.shutdown {
                break;
            }
            std::mem::take(&mut q.records)
        };

        for (lsn, recs) in batch {
            for rec in recs {
                let out = apply_record(&shared.index, &rec);
                record_wal_applied(out.pages_written);
                // место в очереди освобождается только после применения
                if let Ok(mut q) = shared.queue.lock() {
                    q.len = q.len.saturating_sub(1);
                }
                shared.cv_space.notify_one();
                // провал по ключу: дыра снимается, но watermark запись не поднимает
                if out.failed_keys > 0 {
                    warn!(
                        "apply lsn={}: {} key(s) failed, watermark not raised",
                        lsn, out.failed_keys
                    );
                }
                shared.watermark.resolve(lsn, out.failed_keys == 0);
            }
        }
    }
    info!(
        "WAL applier stopped at watermark {}",
        shared.watermark.current()
    );
}
