//! index/pins — LSN активных читателей.
//!
//! Каждый GetPage закрепляет запрошенный LSN на время чтения (RAII PinGuard).
//! Компактор не опускает горизонт выше самого старого закреплённого LSN, поэтому
//! версия, видимая активному читателю, не может быть удалена у него из-под ног.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct PinTable {
    // lsn -> number of readers holding it
    counts: BTreeMap<u64, usize>,
}

/// Registry of pinned read LSNs.
#[derive(Clone, Default)]
pub struct LsnPins {
    inner: Arc<Mutex<PinTable>>,
}

impl LsnPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `lsn` until the returned guard is dropped.
    pub fn pin(&self, lsn: u64) -> PinGuard {
        if let Ok(mut t) = self.inner.lock() {
            *t.counts.entry(lsn).or_insert(0) += 1;
        }
        PinGuard {
            pins: self.clone(),
            lsn,
        }
    }

    /// Oldest pinned LSN, if any reader is active.
    pub fn oldest(&self) -> Option<u64> {
        let t = self.inner.lock().ok()?;
        t.counts.keys().next().copied()
    }

    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .map(|t| t.counts.values().sum())
            .unwrap_or(0)
    }

    fn unpin(&self, lsn: u64) {
        if let Ok(mut t) = self.inner.lock() {
            if let Some(n) = t.counts.get_mut(&lsn) {
                *n -= 1;
                if *n == 0 {
                    t.counts.remove(&lsn);
                }
            }
        }
    }
}

/// RAII pin: unpins on drop.
pub struct PinGuard {
    pins: LsnPins,
    lsn: u64,
}

impl PinGuard {
    pub fn lsn(&self) -> u64 {
        self.lsn
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins.unpin(self.lsn);
    }
}
