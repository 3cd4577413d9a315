//! Lightweight per-tablet load counters.
//!
//! Counters are best-effort and local to the process hosting the tablet.
//! They feed workload reports and split decisions; nothing correctness
//! related reads them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one tablet's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TabletLoadSnapshot {
    pub write_ops: u64,
    pub read_ops: u64,
    pub rows_scanned: u64,
    pub rows_returned: u64,
}

/// Tracks per-tablet operation counters.
#[derive(Debug, Default)]
pub struct TabletLoad {
    write_ops: AtomicU64,
    read_ops: AtomicU64,
    rows_scanned: AtomicU64,
    rows_returned: AtomicU64,
}

impl TabletLoad {
    pub fn record_write(&self) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, scanned: u64, returned: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        if scanned > 0 {
            self.rows_scanned.fetch_add(scanned, Ordering::Relaxed);
        }
        if returned > 0 {
            self.rows_returned.fetch_add(returned, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TabletLoadSnapshot {
        TabletLoadSnapshot {
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
        }
    }
}
