use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Copies sources into the scratch directory under collision-free names.
#[derive(Debug)]
pub struct Stager {
    scratch_dir: PathBuf,
    counter: AtomicU64,
}

impl Stager {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// `<scratch>/<n>.<ext>` for the next counter value, keeping the
    /// source's extension so capabilities can sniff the format.
    pub fn next_temp_path(&self, source: &Path) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = match source.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => format!("{n}.{ext}"),
            None => n.to_string(),
        };
        self.scratch_dir.join(name)
    }

    /// Copy `source` to a fresh temp path. A partial copy is removed before
    /// the error is returned.
    pub async fn stage(&self, source: &Path) -> Result<PathBuf, DispatchError> {
        let staged = self.next_temp_path(source);
        if let Err(error) = fs::copy(source, &staged).await {
            self.discard(&staged).await;
            return Err(DispatchError::Staging {
                source_path: source.to_path_buf(),
                staged_path: staged,
                error,
            });
        }
        debug!(target: "intake::dispatch", source = %source.display(), staged = %staged.display(), "staged");
        Ok(staged)
    }

    /// Best-effort removal of a staged copy. Failures are logged and
    /// swallowed; returns whether the file is gone.
    pub async fn discard(&self, staged: &Path) -> bool {
        match fs::remove_file(staged).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => {
                warn!(target: "intake::dispatch", staged = %staged.display(), error = %err, "CleanupFailure: could not remove temp file");
                false
            }
        }
    }
}

/// Make sure `dir` exists and is empty. Returns the number of entries
/// removed.
pub async fn purge_scratch(dir: &Path) -> io::Result<usize> {
    fs::create_dir_all(dir).await?;
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!(target: "intake::dispatch", path = %path.display(), error = %err, "failed to purge scratch entry");
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn temp_names_are_unique_and_keep_extension() {
        let stager = Stager::new("/scratch");
        assert_eq!(stager.next_temp_path(Path::new("/in/a.flac")), PathBuf::from("/scratch/1.flac"));
        assert_eq!(stager.next_temp_path(Path::new("/in/a.flac")), PathBuf::from("/scratch/2.flac"));
        assert_eq!(stager.next_temp_path(Path::new("/in/README")), PathBuf::from("/scratch/3"));
    }

    #[tokio::test]
    async fn stage_copies_and_discard_removes() {
        let tmp = tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        let source = tmp.path().join("a.dat");
        std::fs::write(&source, b"payload").unwrap();

        let stager = Stager::new(&scratch);
        let staged = stager.stage(&source).await.unwrap();
        assert_eq!(std::fs::read(&staged).unwrap(), b"payload");
        assert!(source.exists());

        assert!(stager.discard(&staged).await);
        assert!(!staged.exists());
        assert!(stager.discard(&staged).await);
    }

    #[tokio::test]
    async fn staging_a_missing_source_fails() {
        let tmp = tempdir().unwrap();
        let stager = Stager::new(tmp.path());
        let err = stager.stage(&tmp.path().join("gone.dat")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Staging { .. }));
    }

    #[tokio::test]
    async fn purge_creates_and_empties_scratch() {
        let tmp = tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        assert_eq!(purge_scratch(&scratch).await.unwrap(), 0);
        assert!(scratch.is_dir());

        std::fs::write(scratch.join("7.dat"), b"stale").unwrap();
        std::fs::create_dir(scratch.join("leftover")).unwrap();
        std::fs::write(scratch.join("leftover/x"), b"x").unwrap();

        assert_eq!(purge_scratch(&scratch).await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
