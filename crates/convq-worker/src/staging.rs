//! Upload staging directories
//!
//! A file moves `incoming → processing → (removed)` on success and
//! `processing → quarantine` on failure. Moves are renames, so exactly one
//! attempt can own a file in `processing` at a time.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn incoming(&self) -> PathBuf {
        self.root.join("incoming")
    }

    pub fn processing(&self) -> PathBuf {
        self.root.join("processing")
    }

    pub fn converted(&self) -> PathBuf {
        self.root.join("converted")
    }

    pub fn quarantine(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    /// Create all four directories
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.incoming(),
            self.processing(),
            self.converted(),
            self.quarantine(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!(root = %self.root.display(), "Upload directories ready");
        Ok(())
    }

    /// Copy an external file into `incoming` under a collision-free name and
    /// return that name.
    pub async fn intake(&self, source: &Path) -> io::Result<String> {
        let original = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", &unique[..12], sanitize(original));

        tokio::fs::copy(source, self.incoming().join(&name)).await?;
        info!(file = %name, "File accepted into incoming");
        Ok(name)
    }

    /// Move a failed attempt's file to quarantine.
    ///
    /// Never fails: a missing file or a failed move is only logged.
    pub async fn quarantine_file(&self, filename: &str) {
        let staged = self.processing().join(filename);
        if !exists(&staged).await {
            return;
        }
        match tokio::fs::rename(&staged, self.quarantine().join(filename)).await {
            Ok(()) => warn!(file = filename, "File moved to quarantine"),
            Err(e) => warn!(file = filename, error = %e, "Failed to quarantine file"),
        }
    }
}

pub(crate) async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Keep names portable: letters, digits, dot, dash and underscore
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Project Plan (v2).mpp"), "Project_Plan__v2_.mpp");
        assert_eq!(sanitize("ok-name_1.mpp"), "ok-name_1.mpp");
    }

    #[tokio::test]
    async fn test_intake_and_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        staging.ensure_dirs().await.unwrap();

        let source = dir.path().join("My Plan.mpp");
        tokio::fs::write(&source, b"data").await.unwrap();
        let name = staging.intake(&source).await.unwrap();
        assert!(name.ends_with("-My_Plan.mpp"));
        assert!(exists(&staging.incoming().join(&name)).await);

        tokio::fs::rename(
            staging.incoming().join(&name),
            staging.processing().join(&name),
        )
        .await
        .unwrap();
        staging.quarantine_file(&name).await;
        assert!(exists(&staging.quarantine().join(&name)).await);
        assert!(!exists(&staging.processing().join(&name)).await);

        // nothing staged: no-op
        staging.quarantine_file("missing.mpp").await;
    }
}
