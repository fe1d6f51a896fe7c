use std::path::Path;

use tracing::{debug, error};

use crate::error::{HarnessError, Result};

/// Checks captured receiver output for the expected markers.
pub struct OutputVerifier;

impl OutputVerifier {
    /// Fail unless the artifact at `path` contains `marker`.
    pub fn assert_contains(path: &Path, marker: &str) -> Result<()> {
        Self::verify_all(path, &[marker])
    }

    /// Fail unless the artifact contains every marker.
    ///
    /// The error lists all absent markers, in the order given, along with the
    /// full captured content.
    pub fn verify_all<S: AsRef<str>>(path: &Path, markers: &[S]) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&bytes);
        Self::check(&content, markers)
    }

    /// Same as [`verify_all`](Self::verify_all) for output already in memory.
    pub fn check<S: AsRef<str>>(content: &str, markers: &[S]) -> Result<()> {
        let missing: Vec<String> = markers
            .iter()
            .map(AsRef::as_ref)
            .filter(|marker| !content.contains(marker))
            .map(str::to_owned)
            .collect();

        if missing.is_empty() {
            debug!(markers = markers.len(), "all markers present");
            return Ok(());
        }

        error!(?missing, "expected content not found");
        Err(HarnessError::MissingExpectedContent {
            missing,
            content: content.to_owned(),
        })
    }
}
