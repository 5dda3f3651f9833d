//! Process-wide write statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Monotonic counters covering the lifetime of one mount.
///
/// Never decremented. The FUSE session may dispatch callbacks from more
/// than one thread, so the counters are atomics. Read once at unmount and
/// formatted to the operator log; not exposed anywhere else.
#[derive(Debug, Default)]
pub struct Stats {
    total_writes: AtomicU64,
    blocked_writes: AtomicU64,
    backups_created: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block(&self) {
        self.blocked_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backup(&self) {
        self.backups_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes.load(Ordering::Relaxed)
    }

    pub fn blocked_writes(&self) -> u64 {
        self.blocked_writes.load(Ordering::Relaxed)
    }

    pub fn backups_created(&self) -> u64 {
        self.backups_created.load(Ordering::Relaxed)
    }

    /// Emit the shutdown statistics block.
    pub fn report(&self) {
        let total = self.total_writes();
        let blocked = self.blocked_writes();
        let blocked_pct = if total > 0 {
            100.0 * blocked as f64 / total as f64
        } else {
            0.0
        };

        info!("shutdown statistics:");
        info!("  total writes:    {}", total);
        info!("  blocked writes:  {} ({:.2}%)", blocked, blocked_pct);
        info!("  backups created: {}", self.backups_created());
    }
}
