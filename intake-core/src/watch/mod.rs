//! Directory watcher feeding discoveries into the registry.
//!
//! Every directory under a root gets its own non-recursive `notify`
//! subscription, tracked as a [`WatchHandle`] so that subscriptions for
//! directories that disappear can be reaped. Raw notifications cross from the
//! `notify` callback thread into a bounded tokio channel and are consumed by
//! a single task ([`DirectoryWatcher::run`]).
//!
//! The consumer only inserts `Pending` entries and walks newly created
//! directories; availability probes, moves and processor calls never run on
//! it. Removing a directory drops the subscriptions beneath it, so a
//! directory recreated at the same path is watched again. When the backend
//! reports lost events (queue overflow) every root is walked again.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::DiscoveryError;
use crate::registry::Registry;

pub mod walk;

pub use walk::{TreeItem, is_candidate_file, walk_tree};

/// Capacity of the channel bridging `notify` callbacks to the consumer task.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Opaque identifier of one directory subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

/// Outcome of one [`DirectoryWatcher::register_tree`] call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeRegistration {
    /// Directories newly subscribed by this walk.
    pub directories: usize,
    /// Files newly inserted into the registry.
    pub discovered: usize,
    /// Directories or entries that could not be handled.
    pub errors: usize,
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

pub struct DirectoryWatcher {
    registry: Arc<Registry>,
    watcher: Mutex<RecommendedWatcher>,
    roots: Mutex<Vec<PathBuf>>,
    subscriptions: DashMap<WatchHandle, PathBuf>,
    by_directory: DashMap<PathBuf, WatchHandle>,
    next_handle: AtomicU64,
    events: Mutex<Option<mpsc::Receiver<WatchMessage>>>,
}

impl fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("registry", &self.registry)
            .field("subscription_count", &self.subscriptions.len())
            .finish()
    }
}

impl DirectoryWatcher {
    pub fn new(registry: Arc<Registry>) -> Result<Self, DiscoveryError> {
        let (tx, rx) = mpsc::channel::<WatchMessage>(EVENT_CHANNEL_CAPACITY);
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let message = match res {
                    Ok(event) => WatchMessage::Event(event),
                    Err(err) => WatchMessage::Error(err.to_string()),
                };
                if let Err(err) = tx.blocking_send(message) {
                    warn!(target: "intake::watch", "watch channel send failed: {err}");
                }
            },
            NotifyConfig::default(),
        )
        .map_err(DiscoveryError::Init)?;

        Ok(Self {
            registry,
            watcher: Mutex::new(watcher),
            roots: Mutex::new(Vec::new()),
            subscriptions: DashMap::new(),
            by_directory: DashMap::new(),
            next_handle: AtomicU64::new(1),
            events: Mutex::new(Some(rx)),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.by_directory.contains_key(dir)
    }

    /// Directories currently subscribed, in handle order.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut subs: Vec<_> = self
            .subscriptions
            .iter()
            .map(|sub| (*sub.key(), sub.value().clone()))
            .collect();
        subs.sort_by_key(|(handle, _)| *handle);
        subs.into_iter().map(|(_, dir)| dir).collect()
    }

    /// Subscribe `dir` unless it already is. Returns the new handle, or
    /// `None` for an already-watched directory.
    pub fn subscribe(&self, dir: &Path) -> Result<Option<WatchHandle>, DiscoveryError> {
        match self.by_directory.entry(dir.to_path_buf()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(vacant) => {
                {
                    let mut watcher = self
                        .watcher
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    watcher
                        .watch(dir, RecursiveMode::NonRecursive)
                        .map_err(|source| DiscoveryError::Subscribe {
                            path: dir.to_path_buf(),
                            source,
                        })?;
                }
                let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
                vacant.insert(handle);
                self.subscriptions.insert(handle, dir.to_path_buf());
                trace!(target: "intake::watch", dir = %dir.display(), handle = handle.0, "subscribed");
                Ok(Some(handle))
            }
        }
    }

    /// Remember `root` for later rescans and register its tree.
    pub fn watch_root(&self, root: &Path) -> TreeRegistration {
        {
            let mut roots = self.roots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !roots.iter().any(|known| known == root) {
                roots.push(root.to_path_buf());
            }
        }
        self.register_tree(root)
    }

    /// Roots recorded through [`DirectoryWatcher::watch_root`].
    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Walk `root` depth-first, subscribing every directory and inserting a
    /// `Pending` entry for every candidate file not already tracked.
    ///
    /// Failures are scoped to the directory or entry they concern: they are
    /// logged, counted and the walk continues.
    pub fn register_tree(&self, root: &Path) -> TreeRegistration {
        let mut outcome = TreeRegistration::default();
        for item in walk_tree(root) {
            match item {
                Ok(TreeItem::Directory(dir)) => match self.subscribe(&dir) {
                    Ok(Some(_)) => outcome.directories += 1,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(target: "intake::watch", error = %err, "directory skipped");
                        outcome.errors += 1;
                    }
                },
                Ok(TreeItem::File(file)) => {
                    if is_candidate_file(&file) && self.registry.discover(file.clone()) {
                        debug!(target: "intake::watch", path = %file.display(), "file discovered");
                        outcome.discovered += 1;
                    }
                }
                Err(err) => {
                    warn!(target: "intake::watch", error = %err, "directory skipped");
                    outcome.errors += 1;
                }
            }
        }
        outcome
    }

    /// Drop every subscription whose directory no longer exists. Returns the
    /// number of subscriptions removed.
    pub fn reap(&self) -> usize {
        self.unsubscribe_where(|dir| !dir.is_dir())
    }

    /// Drop the subscriptions of `dir` and every directory below it. Returns
    /// the number of subscriptions removed.
    pub fn forget_subtree(&self, dir: &Path) -> usize {
        self.unsubscribe_where(|watched| watched.starts_with(dir))
    }

    fn unsubscribe_where(&self, predicate: impl Fn(&Path) -> bool) -> usize {
        let stale: Vec<(WatchHandle, PathBuf)> = self
            .subscriptions
            .iter()
            .filter(|sub| predicate(sub.value().as_path()))
            .map(|sub| (*sub.key(), sub.value().clone()))
            .collect();

        for (handle, dir) in &stale {
            self.subscriptions.remove(handle);
            self.by_directory.remove_if(dir, |_, current| current == handle);
            let mut watcher = self
                .watcher
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // The kernel usually dropped the watch together with the directory.
            let _ = watcher.unwatch(dir);
            trace!(target: "intake::watch", dir = %dir.display(), handle = handle.0, "subscription dropped");
        }
        stale.len()
    }

    /// Consume filesystem notifications until `shutdown` fires or the
    /// notification stream ends. May be called once; later calls return
    /// immediately.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let receiver = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut rx) = receiver else {
            warn!(target: "intake::watch", "watcher loop already started");
            return;
        };

        info!(target: "intake::watch", subscriptions = self.subscription_count(), "watcher loop started");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            match message {
                WatchMessage::Event(event) => self.handle_event(event).await,
                WatchMessage::Error(error) => {
                    warn!(target: "intake::watch", %error, "filesystem watcher error");
                }
            }
        }
        info!(target: "intake::watch", "watcher loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        if event.need_rescan() {
            self.rescan().await;
        }
        if is_departure_kind(&event.kind) {
            let departed: Vec<PathBuf> = event
                .paths
                .into_iter()
                .filter(|path| self.is_watching(path))
                .collect();
            if departed.is_empty() {
                return;
            }
            let watcher = Arc::clone(self);
            let forget = spawn_blocking(move || {
                for dir in &departed {
                    let dropped = watcher.forget_subtree(dir);
                    debug!(target: "intake::watch", dir = %dir.display(), dropped, "directory left the tree");
                }
            });
            if let Err(join_err) = forget.await {
                warn!(target: "intake::watch", "unsubscribe panicked: {join_err}");
            }
            return;
        }
        if !is_discovery_kind(&event.kind) {
            return;
        }
        let arrival = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        );
        for path in event.paths {
            let Ok(metadata) = std::fs::symlink_metadata(&path) else {
                // Gone again before we looked; nothing to discover.
                continue;
            };
            if metadata.is_file() {
                if is_candidate_file(&path) && self.registry.discover(path.clone()) {
                    debug!(target: "intake::watch", path = %path.display(), "file discovered");
                }
            } else if metadata.is_dir() {
                // A new directory may already hold files, so walk it instead
                // of only subscribing.
                let watcher = Arc::clone(self);
                let dir = path.clone();
                let walk = spawn_blocking(move || {
                    if arrival {
                        // A stale subscription left by an earlier directory
                        // at this path would block the new watch.
                        watcher.forget_subtree(&dir);
                    }
                    watcher.register_tree(&dir)
                });
                match walk.await {
                    Ok(outcome) => {
                        debug!(
                            target: "intake::watch",
                            dir = %path.display(),
                            directories = outcome.directories,
                            discovered = outcome.discovered,
                            "new directory registered"
                        );
                    }
                    Err(join_err) => {
                        warn!(target: "intake::watch", dir = %path.display(), "directory walk panicked: {join_err}");
                    }
                }
            }
        }
    }

    /// Walk every recorded root again after the backend lost events.
    async fn rescan(self: &Arc<Self>) {
        let roots = self.roots();
        warn!(target: "intake::watch", roots = roots.len(), "watcher lost events; rescanning roots");
        let watcher = Arc::clone(self);
        let walk = spawn_blocking(move || {
            watcher.reap();
            roots
                .into_iter()
                .map(|root| {
                    let outcome = watcher.register_tree(&root);
                    (root, outcome)
                })
                .collect::<Vec<_>>()
        });
        match walk.await {
            Ok(outcomes) => {
                for (root, outcome) in outcomes {
                    info!(
                        target: "intake::watch",
                        root = %root.display(),
                        directories = outcome.directories,
                        discovered = outcome.discovered,
                        errors = outcome.errors,
                        "root rescanned"
                    );
                }
            }
            Err(join_err) => {
                warn!(target: "intake::watch", "rescan panicked: {join_err}");
            }
        }
    }
}

fn is_departure_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
    )
}

fn is_discovery_kind(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use notify::event::Flag;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn register_tree_discovers_files_and_skips_bookkeeping() {
        let tmp = tempdir().unwrap();
        let album = tmp.path().join("album");
        fs::create_dir(&album).unwrap();
        fs::write(album.join("track.dat"), b"x").unwrap();
        fs::write(album.join("old.dat.err"), b"diag").unwrap();
        fs::write(album.join("moved.dat.mrk"), b"/elsewhere").unwrap();

        let registry = Arc::new(Registry::new());
        let watcher = DirectoryWatcher::new(Arc::clone(&registry)).unwrap();
        let outcome = watcher.register_tree(tmp.path());

        assert_eq!(outcome.directories, 2);
        assert_eq!(outcome.discovered, 1);
        assert!(registry.contains(&album.join("track.dat")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registering_twice_is_idempotent() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.dat"), b"x").unwrap();

        let registry = Arc::new(Registry::new());
        let watcher = DirectoryWatcher::new(Arc::clone(&registry)).unwrap();
        watcher.register_tree(tmp.path());
        let second = watcher.register_tree(tmp.path());

        assert_eq!(second, TreeRegistration::default());
        assert_eq!(watcher.subscription_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reap_drops_deleted_directories_only() {
        let tmp = tempdir().unwrap();
        let gone = tmp.path().join("gone");
        fs::create_dir(&gone).unwrap();

        let watcher = DirectoryWatcher::new(Arc::new(Registry::new())).unwrap();
        watcher.register_tree(tmp.path());
        assert_eq!(watcher.subscription_count(), 2);

        fs::remove_dir(&gone).unwrap();
        assert_eq!(watcher.reap(), 1);
        assert!(!watcher.is_watching(&gone));
        assert!(watcher.is_watching(tmp.path()));
        assert_eq!(watcher.reap(), 0);
    }

    #[test]
    fn forget_subtree_drops_nested_subscriptions() {
        let tmp = tempdir().unwrap();
        let album = tmp.path().join("album");
        fs::create_dir_all(album.join("disc1")).unwrap();
        fs::create_dir(tmp.path().join("albums")).unwrap();

        let watcher = DirectoryWatcher::new(Arc::new(Registry::new())).unwrap();
        watcher.register_tree(tmp.path());
        assert_eq!(watcher.subscription_count(), 4);

        assert_eq!(watcher.forget_subtree(&album), 2);
        assert!(!watcher.is_watching(&album.join("disc1")));
        assert!(watcher.is_watching(&tmp.path().join("albums")));
        assert!(watcher.is_watching(tmp.path()));
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn directory_recreated_at_same_path_is_watched_again() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let album = root.join("album");
        fs::create_dir(&album).unwrap();

        let registry = Arc::new(Registry::new());
        let watcher = Arc::new(DirectoryWatcher::new(Arc::clone(&registry)).unwrap());
        watcher.watch_root(&root);
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(Arc::clone(&watcher).run(shutdown.clone()));

        fs::remove_dir(&album).unwrap();
        assert!(wait_until(|| !watcher.is_watching(&album)).await);
        fs::create_dir(&album).unwrap();
        assert!(wait_until(|| watcher.is_watching(&album)).await);

        let late = album.join("late.dat");
        fs::write(&late, b"late").unwrap();
        assert!(wait_until(|| registry.contains(&late)).await);

        shutdown.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn lost_events_trigger_a_rescan_of_roots() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let registry = Arc::new(Registry::new());
        let watcher = Arc::new(DirectoryWatcher::new(Arc::clone(&registry)).unwrap());
        watcher.watch_root(&root);
        assert_eq!(watcher.roots(), vec![root.clone()]);

        // Nothing consumes notifications here, as after a queue overflow.
        fs::create_dir(root.join("burst")).unwrap();
        fs::write(root.join("burst/missed.dat"), b"x").unwrap();
        fs::write(root.join("also-missed.dat"), b"y").unwrap();
        assert_eq!(registry.len(), 0);

        watcher
            .handle_event(Event::new(EventKind::Other).set_flag(Flag::Rescan))
            .await;

        assert!(registry.contains(&root.join("burst/missed.dat")));
        assert!(registry.contains(&root.join("also-missed.dat")));
        assert!(watcher.is_watching(&root.join("burst")));
    }

    #[tokio::test]
    async fn new_directory_with_files_is_discovered_without_restart() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let registry = Arc::new(Registry::new());
        let watcher = Arc::new(DirectoryWatcher::new(Arc::clone(&registry)).unwrap());
        watcher.register_tree(&root);

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(Arc::clone(&watcher).run(shutdown.clone()));

        let album = root.join("new_album");
        fs::create_dir(&album).unwrap();
        fs::write(album.join("one.dat"), b"1").unwrap();
        fs::write(album.join("two.dat"), b"2").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while registry.len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(registry.contains(&album.join("one.dat")));
        assert!(registry.contains(&album.join("two.dat")));
        assert!(watcher.is_watching(&album));

        shutdown.cancel();
        loop_handle.await.unwrap();
    }
}
