//! SentinelFS command-line entry point.
//!
//! # Usage
//!
//! ```bash
//! # Protect /srv/data, exposing it at /mnt/safe
//! sentinelfs /srv/data /mnt/safe
//!
//! # Looser threshold, verbose logging
//! sentinelfs /srv/data /mnt/safe --entropy-threshold 7.8 -v
//! ```

use anyhow::Context;
use clap::Parser;
use sentinelfs::{Config, SentinelFs};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "sentinelfs")]
#[command(author, version, about = "Real-time ransomware detection at the write path")]
struct Cli {
    /// Backing directory whose contents are re-exported through the mount
    storage: PathBuf,

    /// Empty directory to mount the protected view on
    mountpoint: PathBuf,

    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Entropy threshold override (bits per byte, exclusive range 0-8)
    #[arg(long, value_name = "BITS")]
    entropy_threshold: Option<f64>,

    /// Backup size limit override in bytes
    #[arg(long, value_name = "BYTES")]
    backup_size_limit: Option<u64>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(threshold) = cli.entropy_threshold {
        config.detection.entropy_threshold = threshold;
    }
    if let Some(limit) = cli.backup_size_limit {
        config.backup.size_limit = limit;
    }
    if cli.allow_other {
        config.mount.allow_other = true;
    }
    if cli.auto_unmount {
        config.mount.auto_unmount = true;
    }

    anyhow::ensure!(
        config.detection.entropy_threshold > 0.0 && config.detection.entropy_threshold < 8.0,
        "entropy threshold must be within (0, 8), got {}",
        config.detection.entropy_threshold
    );

    let fs = SentinelFs::new(cli.storage, &config)?;

    info!("storage:           {}", fs.storage_root().display());
    info!("mount point:       {}", cli.mountpoint.display());
    info!(
        "entropy threshold: {:.1} bits/byte",
        config.detection.entropy_threshold
    );
    info!("backup size limit: {} bytes", config.backup.size_limit);

    sentinelfs::mount(fs, &cli.mountpoint, &config)?;

    Ok(())
}
