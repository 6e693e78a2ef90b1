//! Marker-file protocol that keeps destructive moves undoable.
//!
//! Before a file is moved away from a watched tree a marker
//! `<name>.mrk` is written beside it, holding the destination path on a
//! single line. The marker is removed only once the move and everything
//! depending on it succeeded ([`PendingMove::commit`]) or the move was undone
//! ([`PendingMove::rollback`]). A marker that survives a crash is replayed by
//! [`recover`] at the next startup, which moves the file back to where the
//! marker sits.
//!
//! A [`PendingMove`] dropped without `commit` or `rollback` leaves its marker
//! on disk on purpose: the next startup restores the original.

use std::ffi::OsStr;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::RecoveryError;

/// Suffix appended to the original file name to form its marker name.
pub const MARKER_SUFFIX: &str = ".mrk";

pub fn marker_path_for(original: &Path) -> PathBuf {
    let mut name = original.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(MARKER_SUFFIX);
    original.with_file_name(name)
}

/// Inverse of [`marker_path_for`]. `None` when `marker` does not carry the
/// marker suffix.
pub fn original_path_for(marker: &Path) -> Option<PathBuf> {
    let name = marker.file_name()?.to_str()?;
    let stem = name.strip_suffix(MARKER_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(marker.with_file_name(stem))
}

/// A move recorded by a marker and not yet settled.
#[derive(Debug)]
#[must_use = "a pending move must be committed or rolled back"]
pub struct PendingMove {
    original: PathBuf,
    destination: PathBuf,
    marker: PathBuf,
}

impl PendingMove {
    pub fn original(&self) -> &Path {
        &self.original
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Settle the move: the marker is deleted and the file stays at its
    /// destination.
    pub async fn commit(self) -> Result<(), RecoveryError> {
        remove_marker(&self.marker).await?;
        debug!(target: "intake::recovery", original = %self.original.display(), destination = %self.destination.display(), "move committed");
        Ok(())
    }

    /// Undo the move and delete the marker. When moving back fails the
    /// marker is kept so that startup recovery can finish the job.
    pub async fn rollback(self) -> Result<(), RecoveryError> {
        move_file(&self.destination, &self.original).await?;
        remove_marker(&self.marker).await?;
        debug!(target: "intake::recovery", original = %self.original.display(), "move rolled back");
        Ok(())
    }
}

/// Record a marker for `original -> destination`, then perform the move.
///
/// Fails with [`RecoveryError::MarkerExists`] when a previous move of the
/// same file was never settled. If the move itself fails the marker is
/// removed again and the original is left where it was.
pub async fn begin_move(original: &Path, destination: &Path) -> Result<PendingMove, RecoveryError> {
    let marker = marker_path_for(original);
    write_marker(&marker, destination).await?;

    if let Err(err) = move_file(original, destination).await {
        if let Err(cleanup) = remove_marker(&marker).await {
            warn!(target: "intake::recovery", marker = %marker.display(), error = %cleanup, "failed to remove marker after aborted move");
        }
        return Err(err);
    }

    Ok(PendingMove {
        original: original.to_path_buf(),
        destination: destination.to_path_buf(),
        marker,
    })
}

/// What happened to one marker during recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkerOutcome {
    /// The destination was moved back to the original location.
    Restored,
    /// The move never happened; only the marker was removed.
    Discarded,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub discarded: usize,
    pub failed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.restored + self.discarded + self.failed
    }
}

/// Replay every marker found under `roots`. Runs once at startup, before the
/// watcher starts. A marker that cannot be resolved is logged and left in
/// place; the remaining markers are still processed.
pub async fn recover(roots: &[PathBuf]) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    for marker in find_markers(roots).await {
        match recover_marker(&marker).await {
            Ok(MarkerOutcome::Restored) => report.restored += 1,
            Ok(MarkerOutcome::Discarded) => report.discarded += 1,
            Err(err) => {
                error!(target: "intake::recovery", marker = %marker.display(), error = %err, "recovery failed");
                report.failed += 1;
            }
        }
    }
    if report.total() > 0 {
        info!(
            target: "intake::recovery",
            restored = report.restored,
            discarded = report.discarded,
            failed = report.failed,
            "marker recovery finished"
        );
    }
    report
}

/// Resolve a single marker.
pub async fn recover_marker(marker: &Path) -> Result<MarkerOutcome, RecoveryError> {
    let original = original_path_for(marker).ok_or_else(|| RecoveryError::Io {
        path: marker.to_path_buf(),
        source: io::Error::new(ErrorKind::InvalidInput, "not a marker file"),
    })?;
    let contents = fs::read_to_string(marker)
        .await
        .map_err(|source| RecoveryError::Io {
            path: marker.to_path_buf(),
            source,
        })?;
    let destination = match contents.lines().next().map(str::trim) {
        Some(line) if !line.is_empty() => PathBuf::from(line),
        _ => return Err(RecoveryError::EmptyMarker(marker.to_path_buf())),
    };

    if path_exists(&destination).await {
        move_file(&destination, &original).await?;
        remove_marker(marker).await?;
        info!(target: "intake::recovery", original = %original.display(), from = %destination.display(), "file restored");
        return Ok(MarkerOutcome::Restored);
    }

    if path_exists(&original).await {
        remove_marker(marker).await?;
        info!(target: "intake::recovery", original = %original.display(), "move never happened; marker removed");
        return Ok(MarkerOutcome::Discarded);
    }

    Err(RecoveryError::Unresolvable {
        marker: marker.to_path_buf(),
        destination,
    })
}

async fn find_markers(roots: &[PathBuf]) -> Vec<PathBuf> {
    let roots = roots.to_vec();
    let walk = spawn_blocking(move || {
        let mut markers = Vec::new();
        for root in &roots {
            for item in WalkDir::new(root).follow_links(false) {
                match item {
                    Ok(dent) if dent.file_type().is_file() => {
                        if original_path_for(dent.path()).is_some() {
                            markers.push(dent.into_path());
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "intake::recovery", root = %root.display(), error = %err, "skipping unreadable path");
                    }
                }
            }
        }
        markers
    });
    match walk.await {
        Ok(markers) => markers,
        Err(join_err) => {
            error!(target: "intake::recovery", "marker scan panicked: {join_err}");
            Vec::new()
        }
    }
}

async fn write_marker(marker: &Path, destination: &Path) -> Result<(), RecoveryError> {
    let io_err = |source| RecoveryError::Io {
        path: marker.to_path_buf(),
        source,
    };
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
        .await
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(RecoveryError::MarkerExists(marker.to_path_buf()));
        }
        Err(err) => return Err(io_err(err)),
    };
    let line = format!("{}\n", destination.display());
    file.write_all(line.as_bytes()).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(())
}

async fn remove_marker(marker: &Path) -> Result<(), RecoveryError> {
    match fs::remove_file(marker).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RecoveryError::Io {
            path: marker.to_path_buf(),
            source,
        }),
    }
}

/// Move `from` to `to`, replacing `to`. Falls back to copy and remove when a
/// rename cannot cross filesystems.
pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<(), RecoveryError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| RecoveryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            fs::copy(from, to).await.map_err(|source| RecoveryError::Io {
                path: to.to_path_buf(),
                source,
            })?;
            fs::remove_file(from).await.map_err(|source| RecoveryError::Io {
                path: from.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(RecoveryError::Io {
            path: from.to_path_buf(),
            source,
        }),
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
