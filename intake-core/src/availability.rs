//! Deciding whether a discovered file still has an active writer.
//!
//! Two policies are provided and the choice is always explicit:
//!
//! * [`LsofProbe`] asks `lsof` once per check whether any process holds the
//!   file open. The scheduler calls it again on every promote tick; once a
//!   file has been reported busy, or the probe itself has failed, for longer
//!   than the configured give-up window the probe answers
//!   [`Availability::TimedOut`].
//! * [`ExclusiveLock`] tries to take a non-blocking exclusive lock on the
//!   file, sleeping and retrying inside a single check until the total
//!   timeout elapses. Open and lock errors are retried the same way; only a
//!   vanished file ends the check early.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{trace, warn};

use crate::error::AvailabilityError;
use crate::runner::{CommandSpec, ProcessRunner};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(360);

/// Verdict of one availability check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Availability {
    Available,
    InUse,
    /// The file stayed busy for the whole allowed window.
    TimedOut { waited: Duration },
}

#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn check(&self, path: &Path) -> Result<Availability, AvailabilityError>;

    async fn is_available(&self, path: &Path) -> bool {
        matches!(self.check(path).await, Ok(Availability::Available))
    }
}

/// Probes with `lsof -t <path>`: the file is free when no process id is
/// printed.
pub struct LsofProbe {
    runner: Arc<dyn ProcessRunner>,
    program: String,
    probe_timeout: Option<Duration>,
    give_up_after: Option<Duration>,
    busy_since: DashMap<PathBuf, Instant>,
}

impl std::fmt::Debug for LsofProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsofProbe")
            .field("program", &self.program)
            .field("probe_timeout", &self.probe_timeout)
            .field("give_up_after", &self.give_up_after)
            .field("busy_count", &self.busy_since.len())
            .finish()
    }
}

impl LsofProbe {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            program: "lsof".to_string(),
            probe_timeout: None,
            give_up_after: None,
            busy_since: DashMap::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Bound a single `lsof` invocation.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Report [`Availability::TimedOut`] once a file has been seen busy for
    /// longer than `window` across successive checks.
    pub fn with_give_up_after(mut self, window: Duration) -> Self {
        self.give_up_after = Some(window);
        self
    }
}

#[async_trait]
impl AvailabilityChecker for LsofProbe {
    async fn check(&self, path: &Path) -> Result<Availability, AvailabilityError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            self.busy_since.remove(path);
            return Err(AvailabilityError::Missing(path.to_path_buf()));
        }

        let mut spec = CommandSpec::new(self.program.as_str())
            .arg("-t")
            .arg(path.to_string_lossy());
        spec.timeout = self.probe_timeout;

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(source) => {
                // An unanswered probe counts as busy.
                if let Availability::TimedOut { waited } = self.note_busy(path) {
                    warn!(target: "intake::availability", path = %path.display(), error = %source, "probe kept failing; giving up");
                    return Ok(Availability::TimedOut { waited });
                }
                return Err(AvailabilityError::Probe {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if output.stdout.trim().is_empty() {
            self.busy_since.remove(path);
            return Ok(Availability::Available);
        }

        trace!(target: "intake::availability", path = %path.display(), holders = %output.stdout.trim(), "file in use");
        Ok(self.note_busy(path))
    }
}

impl LsofProbe {
    fn note_busy(&self, path: &Path) -> Availability {
        let first_seen = *self
            .busy_since
            .entry(path.to_path_buf())
            .or_insert_with(Instant::now);
        let waited = first_seen.elapsed();
        match self.give_up_after {
            Some(window) if waited >= window => {
                self.busy_since.remove(path);
                Availability::TimedOut { waited }
            }
            _ => Availability::InUse,
        }
    }
}

/// Takes a non-blocking exclusive lock, retrying every `retry_interval`
/// until `total_timeout` has elapsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExclusiveLock {
    pub retry_interval: Duration,
    pub total_timeout: Duration,
}

impl Default for ExclusiveLock {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
        }
    }
}

impl ExclusiveLock {
    pub fn new(retry_interval: Duration, total_timeout: Duration) -> Self {
        Self {
            retry_interval,
            total_timeout,
        }
    }

    fn try_once(path: &Path) -> Result<bool, AvailabilityError> {
        let file = open_for_lock(path)?;
        match file.try_lock() {
            Ok(()) => Ok(true),
            Err(TryLockError::WouldBlock) => Ok(false),
            Err(TryLockError::Error(source)) => Err(AvailabilityError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
        // `file` drops here and releases the lock.
    }
}

fn open_for_lock(path: &Path) -> Result<File, AvailabilityError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| match source.kind() {
            ErrorKind::NotFound => AvailabilityError::Missing(path.to_path_buf()),
            _ => AvailabilityError::Io {
                path: path.to_path_buf(),
                source,
            },
        })
}

#[async_trait]
impl AvailabilityChecker for ExclusiveLock {
    async fn check(&self, path: &Path) -> Result<Availability, AvailabilityError> {
        let started = Instant::now();
        let mut last_error = None;
        loop {
            match Self::try_once(path) {
                Ok(true) => return Ok(Availability::Available),
                Ok(false) => {}
                Err(err @ AvailabilityError::Missing(_)) => return Err(err),
                // Unopenable or unlockable files are retried like busy ones.
                Err(err) => {
                    trace!(target: "intake::availability", path = %path.display(), error = %err, "lock attempt failed");
                    last_error = Some(err);
                }
            }
            let waited = started.elapsed();
            if waited >= self.total_timeout {
                if let Some(err) = last_error {
                    warn!(target: "intake::availability", path = %path.display(), error = %err, "lock never obtainable; giving up");
                }
                return Ok(Availability::TimedOut { waited });
            }
            trace!(target: "intake::availability", path = %path.display(), "lock busy, retrying");
            let remaining = self.total_timeout - waited;
            tokio::time::sleep(self.retry_interval.min(remaining)).await;
        }
    }
}
