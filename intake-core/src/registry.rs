//! Concurrent store of in-flight file entries.
//!
//! The registry is shared by the watcher (inserts), the scheduler ticks
//! (snapshots, transitions, removals) and the dispatch workers (terminal
//! transitions). Every mutation of an entry happens under the write lock of
//! its `DashMap` shard, which is what makes [`Registry::claim`] exclusive.

use std::fmt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::entry::{EntryStatus, FileEntry};
use crate::error::RegistryError;

#[derive(Default)]
pub struct Registry {
    entries: DashMap<PathBuf, FileEntry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entry_count", &self.entries.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `Pending` entry for `path` unless one already exists.
    /// Returns `true` when a new entry was created.
    pub fn discover(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        match self.entries.entry(path) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let entry = FileEntry::new(vacant.key().clone());
                trace!(target: "intake::registry", path = %entry.source_path().display(), "entry created");
                vacant.insert(entry);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<FileEntry> {
        self.entries.get(path).map(|entry| entry.clone())
    }

    pub fn status_of(&self, path: &Path) -> Option<EntryStatus> {
        self.entries.get(path).map(|entry| entry.status())
    }

    /// Point-in-time copy of every entry. Callers iterate the copy so that
    /// concurrent inserts and removals never interfere with a tick.
    pub fn snapshot(&self) -> Vec<FileEntry> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot restricted to one status.
    pub fn snapshot_with_status(&self, status: EntryStatus) -> Vec<FileEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.status() == status)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Move the entry for `path` from `from` to `to`.
    ///
    /// Fails when the entry is missing, is not currently in `from`, or when
    /// `from -> to` is not a legal edge.
    pub fn transition(
        &self,
        path: &Path,
        from: EntryStatus,
        to: EntryStatus,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_path_buf()))?;
        if entry.status() != from || !entry.advance(to) {
            return Err(RegistryError::IllegalTransition {
                path: path.to_path_buf(),
                from: entry.status(),
                to,
            });
        }
        Ok(())
    }

    /// Atomically claim a `Ready` entry for dispatch (`Ready -> Processing`).
    ///
    /// Exactly one caller wins for a given entry; every other concurrent
    /// caller gets `false`.
    pub fn claim(&self, path: &Path) -> bool {
        self.transition(path, EntryStatus::Ready, EntryStatus::Processing)
            .is_ok()
    }

    /// Drive the entry to `Error` from whatever non-terminal state allows it,
    /// recording `reason` in its log.
    pub fn fail(&self, path: &Path, reason: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_path_buf()))?;
        let from = entry.status();
        if !entry.advance(EntryStatus::Error) {
            return Err(RegistryError::IllegalTransition {
                path: path.to_path_buf(),
                from,
                to: EntryStatus::Error,
            });
        }
        entry.log(format!("ERROR: {reason}"));
        Ok(())
    }

    /// Append a note to the entry's log. Missing entries are ignored.
    pub fn log(&self, path: &Path, message: impl Into<String>) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.log(message);
        }
    }

    pub(crate) fn set_temp_path(&self, path: &Path, temp_path: Option<PathBuf>) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.set_temp_path(temp_path);
        }
    }

    /// Drop a `Pending` entry whose file disappeared before it settled.
    pub fn forget_pending(&self, path: &Path) -> Option<FileEntry> {
        self.entries
            .remove_if(path, |_, entry| entry.status() == EntryStatus::Pending)
            .map(|(_, entry)| entry)
    }

    /// Remove a terminal entry. Non-terminal entries are left in place and
    /// `None` is returned.
    pub fn remove_terminal(&self, path: &Path) -> Option<FileEntry> {
        self.entries
            .remove_if(path, |_, entry| entry.status().is_terminal())
            .map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn discovering_twice_yields_one_entry() {
        let registry = Registry::new();
        assert!(registry.discover("/inbox/a.dat"));
        assert!(!registry.discover("/inbox/a.dat"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rediscovery_does_not_reset_progress() {
        let registry = Registry::new();
        let path = Path::new("/inbox/a.dat");
        registry.discover(path);
        registry
            .transition(path, EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();
        registry.discover(path);
        assert_eq!(registry.status_of(path), Some(EntryStatus::Ready));
    }

    #[test]
    fn transition_rejects_stale_from_state() {
        let registry = Registry::new();
        let path = Path::new("/inbox/a.dat");
        registry.discover(path);
        let err = registry
            .transition(path, EntryStatus::Ready, EntryStatus::Processing)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::IllegalTransition {
                from: EntryStatus::Pending,
                to: EntryStatus::Processing,
                ..
            }
        ));
    }

    #[test]
    fn claim_requires_ready() {
        let registry = Registry::new();
        let path = Path::new("/inbox/a.dat");
        registry.discover(path);
        assert!(!registry.claim(path));
        registry
            .transition(path, EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();
        assert!(registry.claim(path));
        assert!(!registry.claim(path));
        assert_eq!(registry.status_of(path), Some(EntryStatus::Processing));
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        let registry = Arc::new(Registry::new());
        let path = PathBuf::from("/inbox/contended.dat");
        registry.discover(path.clone());
        registry
            .transition(&path, EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();

        let wins = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let wins = Arc::clone(&wins);
                let path = path.clone();
                std::thread::spawn(move || {
                    if registry.claim(&path) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fail_records_reason_and_is_terminal() {
        let registry = Registry::new();
        let path = Path::new("/inbox/a.dat");
        registry.discover(path);
        registry.fail(path, "still locked").unwrap();
        let entry = registry.get(path).unwrap();
        assert_eq!(entry.status(), EntryStatus::Error);
        assert_eq!(
            entry.events().last().map(|e| e.message.as_str()),
            Some("ERROR: still locked")
        );
        assert!(registry.fail(path, "again").is_err());
    }

    #[test]
    fn only_terminal_entries_are_removed() {
        let registry = Registry::new();
        let path = Path::new("/inbox/a.dat");
        registry.discover(path);
        assert!(registry.remove_terminal(path).is_none());
        registry.fail(path, "boom").unwrap();
        assert!(registry.remove_terminal(path).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn forget_pending_leaves_progressed_entries() {
        let registry = Registry::new();
        registry.discover("/inbox/a.dat");
        registry.discover("/inbox/b.dat");
        registry
            .transition(Path::new("/inbox/b.dat"), EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();
        assert!(registry.forget_pending(Path::new("/inbox/a.dat")).is_some());
        assert!(registry.forget_pending(Path::new("/inbox/b.dat")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_filters_by_status() {
        let registry = Registry::new();
        registry.discover("/inbox/a.dat");
        registry.discover("/inbox/b.dat");
        registry
            .transition(Path::new("/inbox/b.dat"), EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();
        let ready = registry.snapshot_with_status(EntryStatus::Ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].source_path(), Path::new("/inbox/b.dat"));
        assert_eq!(registry.snapshot().len(), 2);
    }
}
