//! Write-path ransomware detection.
//!
//! Two stages, short-circuit: structural classification against a small
//! whitelist, then Shannon entropy against the block threshold. Ransomware
//! has to emit high-entropy output; the whitelist carves out the legitimate
//! structured formats before entropy is consulted.

pub mod classifier;
pub mod entropy;
pub mod whitelist;

pub use classifier::Classifier;

use crate::stats::Stats;
use std::sync::Arc;
use tracing::warn;

/// Outcome of scanning one write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The write may proceed to the backing store.
    Allow,
    /// The write is refused; the caller sees EIO.
    Block,
}

/// How the whitelist stage judged the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// Known-safe content type, or a shebang prefix.
    Whitelisted,
    /// Not on the whitelist; entropy decides.
    Unknown,
}

/// Record of a single scan.
///
/// A block is a decision, not an error: it stays distinct from I/O
/// failures inside the crate even though both render as EIO at the FUSE
/// boundary.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub label: Label,
    /// Measured entropy; computed only when the whitelist does not match.
    pub entropy: Option<f64>,
    pub verdict: Verdict,
}

/// The write-buffer detector: classifier, whitelist policy, entropy
/// threshold. Stateless between calls; every buffer is judged on its own.
pub struct Detector {
    classifier: Classifier,
    threshold: f64,
    stats: Arc<Stats>,
}

impl Detector {
    /// Build a detector. Opens the libmagic handle; failure here must
    /// abort the mount.
    pub fn new(threshold: f64, stats: Arc<Stats>) -> anyhow::Result<Self> {
        Ok(Self {
            classifier: Classifier::open()?,
            threshold,
            stats,
        })
    }

    /// Judge one write buffer.
    ///
    /// Whitelisted content is allowed regardless of entropy. Otherwise the
    /// buffer is blocked iff its entropy strictly exceeds the threshold;
    /// a buffer measuring exactly at the threshold passes.
    pub fn scan(&self, data: &[u8]) -> Decision {
        self.stats.record_write();

        let label = self.classifier.classify(data);
        if whitelist::is_safe(&label, data) {
            return Decision {
                label: Label::Whitelisted,
                entropy: None,
                verdict: Verdict::Allow,
            };
        }

        let entropy = entropy::measure(data);
        if entropy > self.threshold {
            self.stats.record_block();
            warn!(
                "blocking high-entropy write: {:.2} bits/byte (threshold {:.1}, type {})",
                entropy, self.threshold, label
            );
            return Decision {
                label: Label::Unknown,
                entropy: Some(entropy),
                verdict: Verdict::Block,
            };
        }

        Decision {
            label: Label::Unknown,
            entropy: Some(entropy),
            verdict: Verdict::Allow,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}
