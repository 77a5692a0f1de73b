//! wal/watermark — AppliedWatermark: монотонный, продвигается только по непрерывному префиксу.
//!
//! Состояние:
//! - applied — текущий watermark (никогда не уменьшается);
//! - pending — LSN записей, принятых в очередь, но ещё не разрешённых (lsn -> count);
//! - done    — применённые записи, которые watermark ещё не «перешагнул» (из-за дыры).
//!
//! Правило продвижения: watermark = max(applied, max{ d in done : d < min(pending) }).
//! Запись, отброшенная без применения (resolve(.., applied=false)), снимает блокировку
//! дыры, но сама watermark не поднимает.
//!
//! Ожидающие (GetPage bounded wait, ack_mode=applied) спят на Condvar с таймаутом.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::deadline_in;

#[derive(Default)]
struct WmState {
    applied: u64,
    pending: BTreeMap<u64, usize>,
    done: BTreeSet<u64>,
}

impl WmState {
    fn advance(&mut self) -> bool {
        let limit = self.pending.keys().next().copied();
        let mut moved = false;
        loop {
            let Some(&d) = self.done.iter().next() else {
                break;
            };
            if let Some(l) = limit {
                if d >= l {
                    break;
                }
            }
            self.done.remove(&d);
            if d > self.applied {
                self.applied = d;
                moved = true;
            }
        }
        moved
    }
}

/// Process-wide applied-LSN watermark.
#[derive(Default)]
pub struct Watermark {
    state: Mutex<WmState>,
    cv: Condvar,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark.
    pub fn current(&self) -> u64 {
        self.state.lock().map(|s| s.applied).unwrap_or(0)
    }

    /// Number of records registered but not yet resolved.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.pending.values().sum())
            .unwrap_or(0)
    }

    /// Register a record entering the apply queue; blocks advancement past `lsn` until resolved.
    pub fn register(&self, lsn: u64) {
        if let Ok(mut s) = self.state.lock() {
            *s.pending.entry(lsn).or_insert(0) += 1;
        }
    }

    /// Mark a registered record as finished. `applied=false` for records discarded unapplied.
    pub fn resolve(&self, lsn: u64, applied: bool) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        if let Some(n) = s.pending.get_mut(&lsn) {
            *n -= 1;
            if *n == 0 {
                s.pending.remove(&lsn);
            }
        }
        if applied {
            s.done.insert(lsn);
        }
        if s.advance() {
            self.cv.notify_all();
        }
    }

    /// Wait until the watermark reaches `lsn` or `timeout` expires. Returns the watermark seen last.
    pub fn wait_for(&self, lsn: u64, timeout: Duration) -> u64 {
        let deadline = deadline_in(timeout);
        let Ok(mut s) = self.state.lock() else {
            return 0;
        };
        while s.applied < lsn {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.cv.wait_timeout(s, deadline - now) {
                Ok((guard, _)) => s = guard,
                Err(_) => return 0,
            }
        }
        s.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn gap_blocks_advancement_until_filled() {
        let wm = Watermark::new();
        wm.register(10);
        wm.register(20);
        wm.register(30);

        wm.resolve(20, true);
        wm.resolve(30, true);
        assert_eq!(wm.current(), 0, "10 is still pending");

        wm.resolve(10, true);
        assert_eq!(wm.current(), 30);
        assert_eq!(wm.pending(), 0);
    }

    #[test]
    fn discarded_record_unblocks_but_does_not_raise() {
        let wm = Watermark::new();
        wm.register(10);
        wm.register(20);
        wm.resolve(20, false);
        assert_eq!(wm.current(), 0);
        wm.resolve(10, true);
        assert_eq!(wm.current(), 10);
    }

    #[test]
    fn never_decreases() {
        let wm = Watermark::new();
        wm.register(50);
        wm.resolve(50, true);
        assert_eq!(wm.current(), 50);

        // late duplicate below the watermark
        wm.register(40);
        wm.resolve(40, true);
        assert_eq!(wm.current(), 50);
    }

    #[test]
    fn wait_for_times_out_and_wakes() {
        let wm = Arc::new(Watermark::new());
        assert_eq!(wm.wait_for(5, Duration::from_millis(20)), 0);

        wm.register(5);
        let w2 = wm.clone();
        let h = thread::spawn(move || w2.wait_for(5, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        wm.resolve(5, true);
        assert_eq!(h.join().unwrap(), 5);
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() {
        let wm = Watermark::new();
        wm.register(1);
        wm.resolve(1, true);
        assert_eq!(wm.wait_for(1, Duration::MAX), 1);
        assert_eq!(wm.wait_for(0, Duration::from_millis(u64::MAX)), 1);
    }
}
