//! Just-in-time pre-image backups.
//!
//! A file is copied into the backup directory the first time it is
//! modified after mount, not when it is opened, so read-heavy workloads
//! cost nothing. "First write" is approximated at write time: the write
//! starts at offset zero and the existing file is non-empty. A rewrite
//! after truncate-to-zero therefore produces a fresh backup, and duplicate
//! backups within the same second overwrite each other.

use crate::stats::Stats;
use anyhow::Context;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const COPY_BUF_SIZE: usize = 8192;

/// Copies pre-images into the backup directory, bounded by a size limit.
///
/// Retention is append-only: nothing here expires, deduplicates or
/// compacts backups.
pub struct BackupManager {
    backup_root: PathBuf,
    size_limit: u64,
    stats: Arc<Stats>,
}

impl BackupManager {
    /// Build the manager, creating the backup directory (mode 0700) if it
    /// does not exist yet.
    pub fn new(backup_root: PathBuf, size_limit: u64, stats: Arc<Stats>) -> anyhow::Result<Self> {
        if !backup_root.exists() {
            std::fs::DirBuilder::new()
                .mode(0o700)
                .create(&backup_root)
                .with_context(|| {
                    format!("failed to create backup directory {}", backup_root.display())
                })?;
        }

        Ok(Self {
            backup_root,
            size_limit,
            stats,
        })
    }

    /// Consulted by the write interceptor before an offset-zero write.
    ///
    /// Backs up the file at `backing_path` when it exists with a non-zero
    /// size no larger than the limit. Never fails from the caller's
    /// perspective: a missing pre-image means nothing to save, oversized
    /// files are skipped with a log line, and copy errors are logged and
    /// swallowed. The write proceeds to detection either way.
    pub fn maybe_backup(&self, backing_path: &Path) {
        let size = match std::fs::metadata(backing_path) {
            Ok(meta) => meta.len(),
            // Nothing to back up.
            Err(_) => return,
        };

        if size == 0 {
            return;
        }

        if size > self.size_limit {
            info!(
                "skipping backup of {}: {} bytes exceeds the {} byte limit",
                backing_path.display(),
                size,
                self.size_limit
            );
            return;
        }

        match self.copy_preimage(backing_path) {
            Ok(dest) => {
                self.stats.record_backup();
                debug!(
                    "JIT backup created: {} -> {}",
                    backing_path.display(),
                    dest.display()
                );
            }
            Err(e) => warn!("backup of {} failed: {}", backing_path.display(), e),
        }
    }

    /// `<backup_root>/<basename>.<unix_seconds>.backup`. Collisions within
    /// the same second overwrite.
    fn destination_for(&self, source: &Path) -> PathBuf {
        let basename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.backup_root
            .join(format!("{basename}.{seconds}.backup"))
    }

    /// Bytewise copy of the pre-image, fdatasynced before returning so the
    /// backup is durable before the triggering write is allowed to land.
    fn copy_preimage(&self, source: &Path) -> std::io::Result<PathBuf> {
        let mut src = File::open(source)?;
        let dest_path = self.destination_for(source);
        let mut dest = File::create(&dest_path)?;

        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
        }
        dest.sync_data()?;

        Ok(dest_path)
    }
}
