//! index — многоверсионное хранилище страниц: (space, page) -> упорядоченные версии (LSN, образ).
//!
//! Разделение:
//! - mod.rs     — PageIndex: put/get/latest, цепочки версий.
//! - pins.rs    — LsnPins: LSN активных читателей (горизонт компактации).
//! - compact.rs — компактация старых версий ниже горизонта.
//!
//! Concurrency:
//! - The outer map lock is held only to look up (or create) a key's chain.
//! - Each chain has its own RwLock: readers of one key never block writers of another,
//!   writers of the same key serialize, so the "strictly increasing LSN" check is race-free.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{PageError, Result};
use crate::page::{PageKey, PageVersion};

pub mod compact;
pub mod pins;

pub use compact::CompactReport;
pub use pins::{LsnPins, PinGuard};

/// Versions of one key, ascending by LSN (strictly increasing).
#[derive(Debug, Default)]
pub(crate) struct VersionChain {
    pub(crate) versions: Vec<PageVersion>,
}

impl VersionChain {
    #[inline]
    fn max_lsn(&self) -> Option<u64> {
        self.versions.last().map(|v| v.lsn)
    }

    /// Greatest version with lsn <= `lsn`.
    fn visible_at(&self, lsn: u64) -> Option<&PageVersion> {
        let idx = self.versions.partition_point(|v| v.lsn <= lsn);
        if idx == 0 {
            None
        } else {
            self.versions.get(idx - 1)
        }
    }
}

type ChainRef = Arc<RwLock<VersionChain>>;

/// Aggregate size of the index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub keys: u64,
    pub versions: u64,
    pub bytes: u64,
}

/// Page Version Index.
pub struct PageIndex {
    page_size: usize,
    chains: RwLock<HashMap<PageKey, ChainRef>>,
}

impl PageIndex {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            chains: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn chain(&self, key: &PageKey) -> Result<Option<ChainRef>> {
        let map = self
            .chains
            .read()
            .map_err(|_| PageError::unavailable("page index poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn chain_or_create(&self, key: PageKey) -> Result<ChainRef> {
        if let Some(c) = self.chain(&key)? {
            return Ok(c);
        }
        let mut map = self
            .chains
            .write()
            .map_err(|_| PageError::unavailable("page index poisoned"))?;
        Ok(map.entry(key).or_default().clone())
    }

    /// Insert a new version. `lsn` must be strictly greater than the key's current maximum.
    pub fn put(&self, key: PageKey, lsn: u64, data: Vec<u8>) -> Result<()> {
        if data.len() != self.page_size {
            return Err(PageError::malformed(format!(
                "page image for {} has {} bytes, expected {}",
                key,
                data.len(),
                self.page_size
            )));
        }
        let chain = self.chain_or_create(key)?;
        let mut c = chain
            .write()
            .map_err(|_| PageError::unavailable("version chain poisoned"))?;
        if let Some(current) = c.max_lsn() {
            if lsn <= current {
                return Err(PageError::StaleWrite { key, lsn, current });
            }
        }
        c.versions.push(PageVersion::new(lsn, data));
        Ok(())
    }

    /// Snapshot read: the version with the greatest stored LSN <= `lsn`.
    pub fn get(&self, key: PageKey, lsn: u64) -> Result<PageVersion> {
        let chain = self.chain(&key)?.ok_or(PageError::NotFound(key))?;
        let c = chain
            .read()
            .map_err(|_| PageError::unavailable("version chain poisoned"))?;
        if c.versions.is_empty() {
            return Err(PageError::NotFound(key));
        }
        c.visible_at(lsn)
            .cloned()
            .ok_or(PageError::NoVisibleVersion { key, lsn })
    }

    /// Most recent version of the key, if any.
    pub fn latest(&self, key: PageKey) -> Result<Option<PageVersion>> {
        let Some(chain) = self.chain(&key)? else {
            return Ok(None);
        };
        let c = chain
            .read()
            .map_err(|_| PageError::unavailable("version chain poisoned"))?;
        Ok(c.versions.last().cloned())
    }

    /// All stored LSNs of a key (ascending). Diagnostics/tests.
    pub fn version_lsns(&self, key: PageKey) -> Result<Vec<u64>> {
        let Some(chain) = self.chain(&key)? else {
            return Ok(Vec::new());
        };
        let c = chain
            .read()
            .map_err(|_| PageError::unavailable("version chain poisoned"))?;
        Ok(c.versions.iter().map(|v| v.lsn).collect())
    }

    pub fn stats(&self) -> IndexStats {
        let mut st = IndexStats::default();
        for chain in self.snapshot_chains() {
            if let Ok(c) = chain.read() {
                if c.versions.is_empty() {
                    continue;
                }
                st.keys += 1;
                st.versions += c.versions.len() as u64;
                st.bytes += c.versions.iter().map(|v| v.len() as u64).sum::<u64>();
            }
        }
        st
    }

    /// Clone the chain handles so callers can walk keys without holding the map lock.
    pub(crate) fn snapshot_chains(&self) -> Vec<ChainRef> {
        match self.chains.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
