//! Structural content classification via libmagic.
//!
//! Prefix checks are spoofable: ransomware can stamp `PK\x03\x04` onto
//! ciphertext and pass for a ZIP. libmagic validates structure beyond the
//! leading bytes, so a faked header does not classify as the real container
//! type.

use magic::cookie::{DatabasePaths, Flags, Load};
use magic::Cookie;
use parking_lot::Mutex;
use tracing::warn;

/// Sentinel label reported when libmagic cannot classify a buffer.
/// Not on the whitelist, so the caller falls through to the entropy stage.
pub const UNKNOWN_LABEL: &str = "application/octet-stream";

/// A libmagic cookie loaded with the default MIME rule database.
///
/// Opened once at mount time, dropped at shutdown. The handle is not
/// reentrant, so it lives behind a mutex; the FUSE session may dispatch
/// callbacks from more than one thread.
pub struct Classifier {
    cookie: Mutex<Cookie<Load>>,
}

// SAFETY: the raw libmagic handle inside `Cookie` is only ever touched
// through `cookie`'s mutex, so it is never accessed concurrently even
// though libmagic's `magic_t` pointer is not `Send` on its own.
unsafe impl Send for Classifier {}
unsafe impl Sync for Classifier {}

impl Classifier {
    /// Open the libmagic handle and load the default rule database.
    ///
    /// Failure is fatal to the mount: without the classifier every PDF,
    /// executable and office document would face the entropy check and be
    /// misblocked.
    pub fn open() -> anyhow::Result<Self> {
        let cookie = Cookie::open(Flags::MIME_TYPE)
            .map_err(|e| anyhow::anyhow!("libmagic init failed: {e}"))?;
        let cookie = cookie
            .load(&DatabasePaths::default())
            .map_err(|e| anyhow::anyhow!("libmagic database load failed: {e}"))?;

        Ok(Self {
            cookie: Mutex::new(cookie),
        })
    }

    /// Classify a buffer, returning a MIME-like label such as
    /// `text/plain` or `application/pdf`.
    ///
    /// Per-buffer classification failure is non-fatal: it is logged and
    /// degrades to [`UNKNOWN_LABEL`].
    pub fn classify(&self, data: &[u8]) -> String {
        match self.cookie.lock().buffer(data) {
            Ok(label) => label,
            Err(e) => {
                warn!("classifier error, treating buffer as unknown: {e}");
                UNKNOWN_LABEL.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::test_support::lcg_bytes;

    #[test]
    fn classifies_ascii_as_text() {
        let classifier = Classifier::open().unwrap();
        let label = classifier.classify(b"Hello from SentinelFS\n");
        assert!(label.starts_with("text/"), "got {label}");
    }

    #[test]
    fn uniform_bytes_are_not_text() {
        let classifier = Classifier::open().unwrap();
        let label = classifier.classify(&lcg_bytes(1024));
        assert!(!label.starts_with("text/"), "got {label}");
    }
}
