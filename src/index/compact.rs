//! index/compact — удаление старых версий ниже горизонта.
//!
//! Правило для каждого ключа:
//! - находим самую новую версию с lsn <= horizon ("опорную");
//! - всё, что старше опорной, удаляется;
//! - опорная и всё новее неё остаются.
//!
//! Самая новая версия ключа не удаляется никогда: если все версии <= horizon,
//! опорной становится именно она.
//!
//! compact_pinned() перечитывает самый старый закреплённый LSN под write-локом каждой цепочки:
//! читатель, закрепившийся после расчёта горизонта, но до захвата цепочки, свою версию не теряет.

use log::debug;

use super::{LsnPins, PageIndex};

/// What a compaction pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactReport {
    pub horizon: u64,
    pub keys_scanned: u64,
    pub keys_compacted: u64,
    pub versions_dropped: u64,
    pub bytes_freed: u64,
}

impl PageIndex {
    /// Drop versions that no reader at or above `horizon` can observe.
    pub fn compact(&self, horizon: u64) -> CompactReport {
        self.compact_inner(horizon, None)
    }

    /// Like `compact`, but never above the oldest LSN pinned in `pins` at the time each chain is locked.
    pub fn compact_pinned(&self, horizon: u64, pins: &LsnPins) -> CompactReport {
        self.compact_inner(horizon, Some(pins))
    }

    fn compact_inner(&self, horizon: u64, pins: Option<&LsnPins>) -> CompactReport {
        let mut rep = CompactReport {
            horizon,
            ..Default::default()
        };

        for chain in self.snapshot_chains() {
            rep.keys_scanned += 1;
            let Ok(mut c) = chain.write() else {
                continue;
            };
            let h = match pins.and_then(|p| p.oldest()) {
                Some(p) => horizon.min(p),
                None => horizon,
            };
            // число версий с lsn <= h; опорная — последняя из них
            let at_or_below = c.versions.partition_point(|v| v.lsn <= h);
            if at_or_below <= 1 {
                continue;
            }
            let drop_n = at_or_below - 1;
            rep.bytes_freed += c.versions[..drop_n]
                .iter()
                .map(|v| v.len() as u64)
                .sum::<u64>();
            c.versions.drain(..drop_n);
            rep.versions_dropped += drop_n as u64;
            rep.keys_compacted += 1;
        }

        if rep.versions_dropped > 0 {
            debug!(
                "compact: horizon={} dropped {} version(s) across {} key(s)",
                horizon, rep.versions_dropped, rep.keys_compacted
            );
        }
        rep
    }
}
