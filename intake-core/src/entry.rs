//! Per-file bookkeeping and the status state machine.
//!
//! A [`FileEntry`] tracks one processing attempt for one source path. Its
//! status only ever moves forward:
//!
//! ```text
//! Pending ──► Ready ──► Processing ──► Processed
//!    │                      │
//!    └──────────► Error ◄───┘
//! ```
//!
//! `Pending -> Error` is taken when the availability check gives up on a
//! file that never stops being written; `Processing -> Error` covers staging
//! and processor failures. Terminal entries are swept by the scheduler and
//! then dropped from the registry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Discovered; a writer may still hold the file open.
    Pending,
    /// Confirmed stable and waiting for a dispatch slot.
    Ready,
    /// Claimed by exactly one dispatch.
    Processing,
    /// Processor succeeded; awaiting delete and prune.
    Processed,
    /// Terminal failure; awaiting the diagnostic sidecar.
    Error,
}

impl EntryStatus {
    /// Whether `self -> next` is one of the legal edges of the state machine.
    pub fn can_advance_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Processing)
                | (Processing, Processed)
                | (Processing, Error)
                | (Pending, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Processed | EntryStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Ready => "READY",
            EntryStatus::Processing => "PROCESSING",
            EntryStatus::Processed => "PROCESSED",
            EntryStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped note in an entry's audit trail.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntryEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One tracked file-processing attempt.
///
/// Equality and hashing use `source_path` only.
#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    source_path: PathBuf,
    temp_path: Option<PathBuf>,
    status: EntryStatus,
    discovered_at: DateTime<Utc>,
    events: Vec<EntryEvent>,
}

impl FileEntry {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        let mut entry = Self {
            source_path: source_path.into(),
            temp_path: None,
            status: EntryStatus::Pending,
            discovered_at: Utc::now(),
            events: Vec::new(),
        };
        entry.log("Entry created");
        entry
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub fn events(&self) -> &[EntryEvent] {
        &self.events
    }

    /// Append a note to the audit trail.
    pub fn log(&mut self, message: impl Into<String>) {
        self.events.push(EntryEvent {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Move to `next` if the edge is legal. Returns `false` and leaves the
    /// entry untouched otherwise.
    pub(crate) fn advance(&mut self, next: EntryStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next != EntryStatus::Processing {
            self.temp_path = None;
        }
        self.log(format!("Changed to status {next}"));
        true
    }

    pub(crate) fn set_temp_path(&mut self, temp_path: Option<PathBuf>) {
        self.temp_path = temp_path;
    }

    /// Render the diagnostic text written to the sidecar file: a header line
    /// followed by one line per event in local time.
    pub fn to_log_string(&self) -> String {
        let mut buffer = format!("{} ({})", self.source_path.display(), self.status);
        for event in &self.events {
            let local: DateTime<Local> = event.at.into();
            buffer.push('\n');
            buffer.push_str(&local.format("%Y.%m.%d %H:%M:%S").to_string());
            buffer.push_str(":  ");
            buffer.push_str(&event.message);
        }
        buffer
    }
}

impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.source_path == other.source_path
    }
}

impl Eq for FileEntry {}

impl Hash for FileEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_path.hash(state);
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source_path.display(), self.status)
    }
}
