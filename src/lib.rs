//! SentinelFS - real-time ransomware detection at the filesystem write path
//!
//! A FUSE stacking filesystem that re-exports a backing directory through a
//! mount point and judges every write before it reaches storage. Writes
//! that look like in-progress encryption are refused with an I/O error;
//! the first write to an existing file triggers a just-in-time backup of
//! its prior contents.
//!
//! # How a write is judged
//!
//! - **Structural classification** - libmagic inspects the buffer and a
//!   small closed whitelist (textual content, PDF, ELF, shell scripts)
//!   bypasses the entropy check.
//! - **Shannon entropy** - everything else is blocked when the buffer
//!   measures above the threshold (default 7.5 bits/byte); ciphertext
//!   cannot avoid landing near 8.
//!
//! # Example
//!
//! ```rust,no_run
//! use sentinelfs::{Config, SentinelFs};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let fs = SentinelFs::new("/srv/data".into(), &config)?;
//!     sentinelfs::mount(fs, "/mnt/protected".as_ref(), &config)?;
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod detector;
pub mod fs;
pub mod stats;

pub use backup::BackupManager;
pub use config::Config;
pub use detector::{Decision, Detector, Label, Verdict};
pub use fs::{mount, SentinelFs};
pub use stats::Stats;
