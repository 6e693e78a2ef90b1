//! Periodic reconciliation of registry entries.
//!
//! Five ticks run as independent tasks on the same period: promote, reap,
//! dispatch, sweep-processed and sweep-failed. Each tick works on a registry
//! snapshot, so entries inserted or removed concurrently are simply picked up
//! (or skipped) on the next run. A fault on one entry is logged and the
//! batch moves on.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::availability::{Availability, AvailabilityChecker};
use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::entry::EntryStatus;
use crate::error::{AvailabilityError, DispatchError};
use crate::registry::Registry;
use crate::sidecar::write_sidecar;
use crate::watch::DirectoryWatcher;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_PROMOTE_CONCURRENCY: usize = 8;

/// The five reconciliation ticks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Tick {
    Promote,
    Reap,
    Dispatch,
    SweepProcessed,
    SweepFailed,
}

impl Tick {
    pub const ALL: [Tick; 5] = [
        Tick::Promote,
        Tick::Reap,
        Tick::Dispatch,
        Tick::SweepProcessed,
        Tick::SweepFailed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tick::Promote => "promote",
            Tick::Reap => "reap",
            Tick::Dispatch => "dispatch",
            Tick::SweepProcessed => "sweep-processed",
            Tick::SweepFailed => "sweep-failed",
        }
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters from one tick run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    /// Entries (or subscriptions) looked at.
    pub examined: usize,
    /// Entries that moved on: promoted, claimed, swept or reaped.
    pub advanced: usize,
    /// Entries that hit a fault or were driven to `Error` by this tick.
    pub failed: usize,
}

impl TickReport {
    fn is_idle(&self) -> bool {
        self.advanced == 0 && self.failed == 0
    }
}

enum PromoteVerdict {
    Promoted,
    Waiting,
    TimedOut,
    Vanished,
    Fault,
}

pub struct ReconciliationScheduler {
    registry: Arc<Registry>,
    checker: Arc<dyn AvailabilityChecker>,
    dispatcher: Arc<Dispatcher>,
    watcher: Option<Arc<DirectoryWatcher>>,
    period: Duration,
    promote_concurrency: usize,
    observers: TaskTracker,
}

impl fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("registry", &self.registry)
            .field("period", &self.period)
            .field("promote_concurrency", &self.promote_concurrency)
            .field("watching", &self.watcher.is_some())
            .finish_non_exhaustive()
    }
}

impl ReconciliationScheduler {
    pub fn new(
        registry: Arc<Registry>,
        checker: Arc<dyn AvailabilityChecker>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            registry,
            checker,
            dispatcher,
            watcher: None,
            period: DEFAULT_TICK_PERIOD,
            promote_concurrency: DEFAULT_PROMOTE_CONCURRENCY,
            observers: TaskTracker::new(),
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<DirectoryWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_promote_concurrency(mut self, limit: usize) -> Self {
        self.promote_concurrency = limit.max(1);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start one task per tick on `tracker`. Each stops when `shutdown`
    /// fires.
    pub fn spawn(self: &Arc<Self>, tracker: &TaskTracker, shutdown: &CancellationToken) {
        for tick in Tick::ALL {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                // First run one period after start.
                let start = tokio::time::Instant::now() + this.period;
                let mut interval = tokio::time::interval_at(start, this.period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                debug!(target: "intake::schedule", %tick, period = ?this.period, "tick started");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    // A promote run may sit in a long availability check.
                    let report = if tick == Tick::Promote {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            report = this.run(tick) => report,
                        }
                    } else {
                        this.run(tick).await
                    };
                    if !report.is_idle() {
                        debug!(
                            target: "intake::schedule",
                            %tick,
                            examined = report.examined,
                            advanced = report.advanced,
                            failed = report.failed,
                            "tick finished"
                        );
                    }
                }
                debug!(target: "intake::schedule", %tick, "tick stopped");
            });
        }
    }

    /// Run one tick inline.
    pub async fn run(&self, tick: Tick) -> TickReport {
        match tick {
            Tick::Promote => self.promote_pending().await,
            Tick::Reap => self.reap_subscriptions(),
            Tick::Dispatch => self.dispatch_ready().await,
            Tick::SweepProcessed => self.sweep_processed().await,
            Tick::SweepFailed => self.sweep_failed().await,
        }
    }

    /// Wait for the dispatch observers spawned by [`Self::dispatch_ready`].
    /// Call after the dispatcher's pool has drained.
    pub async fn wait_for_observers(&self) {
        self.observers.close();
        self.observers.wait().await;
    }

    /// Check every `Pending` entry and promote the settled ones.
    pub async fn promote_pending(&self) -> TickReport {
        let pending = self.registry.snapshot_with_status(EntryStatus::Pending);
        let mut report = TickReport {
            examined: pending.len(),
            ..TickReport::default()
        };

        let verdicts: Vec<PromoteVerdict> = stream::iter(pending)
            .map(|entry| async move { self.promote_one(entry.source_path()).await })
            .buffer_unordered(self.promote_concurrency)
            .collect()
            .await;

        for verdict in verdicts {
            match verdict {
                PromoteVerdict::Promoted | PromoteVerdict::Vanished => report.advanced += 1,
                PromoteVerdict::TimedOut | PromoteVerdict::Fault => report.failed += 1,
                PromoteVerdict::Waiting => {}
            }
        }
        report
    }

    async fn promote_one(&self, path: &Path) -> PromoteVerdict {
        match self.checker.check(path).await {
            Ok(Availability::Available) => {
                match self
                    .registry
                    .transition(path, EntryStatus::Pending, EntryStatus::Ready)
                {
                    Ok(()) => {
                        trace!(target: "intake::schedule", path = %path.display(), "promoted");
                        PromoteVerdict::Promoted
                    }
                    Err(err) => {
                        debug!(target: "intake::schedule", path = %path.display(), error = %err, "promotion skipped");
                        PromoteVerdict::Fault
                    }
                }
            }
            Ok(Availability::InUse) => PromoteVerdict::Waiting,
            Ok(Availability::TimedOut { waited }) => {
                let reason = format!("file remained in use for {}s", waited.as_secs());
                match self.registry.fail(path, &reason) {
                    Ok(()) => warn!(target: "intake::schedule", path = %path.display(), "{reason}"),
                    Err(err) => {
                        debug!(target: "intake::schedule", path = %path.display(), error = %err, "timeout not recorded");
                    }
                }
                PromoteVerdict::TimedOut
            }
            Err(AvailabilityError::Missing(_)) => {
                if self.registry.forget_pending(path).is_some() {
                    debug!(target: "intake::schedule", path = %path.display(), "pending file vanished");
                }
                PromoteVerdict::Vanished
            }
            Err(err) => {
                warn!(target: "intake::schedule", path = %path.display(), error = %err, "availability check failed");
                PromoteVerdict::Fault
            }
        }
    }

    /// Drop watch subscriptions for directories that no longer exist.
    pub fn reap_subscriptions(&self) -> TickReport {
        let Some(watcher) = &self.watcher else {
            return TickReport::default();
        };
        let examined = watcher.subscription_count();
        let reaped = watcher.reap();
        if reaped > 0 {
            debug!(target: "intake::schedule", reaped, "stale subscriptions reaped");
        }
        TickReport {
            examined,
            advanced: reaped,
            failed: 0,
        }
    }

    /// Claim each `Ready` entry and hand it to the dispatcher.
    pub async fn dispatch_ready(&self) -> TickReport {
        let ready = self.registry.snapshot_with_status(EntryStatus::Ready);
        let mut report = TickReport {
            examined: ready.len(),
            ..TickReport::default()
        };

        for entry in ready {
            let path = entry.source_path().to_path_buf();
            if !self.registry.claim(&path) {
                continue;
            }
            match self.dispatcher.submit(path.clone()).await {
                Ok(handle) => {
                    report.advanced += 1;
                    self.observe(handle);
                }
                Err(err) => {
                    report.failed += 1;
                    self.abort(&path, &err);
                }
            }
        }
        report
    }

    fn observe(&self, handle: DispatchHandle) {
        let registry = Arc::clone(&self.registry);
        self.observers.spawn(async move {
            let path = handle.path().to_path_buf();
            if let Err(err) = handle.wait().await {
                abort_entry(&registry, &path, &err);
            }
        });
    }

    fn abort(&self, path: &Path, err: &DispatchError) {
        abort_entry(&self.registry, path, err);
    }

    /// Delete processed sources, prune emptied directories and drop the
    /// entries.
    pub async fn sweep_processed(&self) -> TickReport {
        let processed = self.registry.snapshot_with_status(EntryStatus::Processed);
        let mut report = TickReport {
            examined: processed.len(),
            ..TickReport::default()
        };

        for entry in processed {
            let path = entry.source_path();
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(target: "intake::schedule", path = %path.display(), error = %err, "could not delete processed file");
                    report.failed += 1;
                    continue;
                }
            }
            if let Some(root) = self.root_of(path) {
                prune_empty_ancestors(path, &root).await;
            }
            self.registry.remove_terminal(path);
            info!(target: "intake::schedule", path = %path.display(), "processed file removed");
            report.advanced += 1;
        }
        report
    }

    /// Write a sidecar for each failed entry, then drop it. Entries whose
    /// sidecar could not be written stay for the next run.
    pub async fn sweep_failed(&self) -> TickReport {
        let failed = self.registry.snapshot_with_status(EntryStatus::Error);
        let mut report = TickReport {
            examined: failed.len(),
            ..TickReport::default()
        };

        for entry in failed {
            match write_sidecar(&entry).await {
                Ok(sidecar) => {
                    self.registry.remove_terminal(entry.source_path());
                    info!(target: "intake::schedule", path = %entry.source_path().display(), sidecar = %sidecar.display(), "failure recorded");
                    report.advanced += 1;
                }
                Err(err) => {
                    warn!(target: "intake::schedule", path = %entry.source_path().display(), error = %err, "could not write sidecar");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn root_of(&self, path: &Path) -> Option<PathBuf> {
        self.dispatcher
            .table()
            .resolve(path)
            .map(|binding| binding.root.clone())
    }
}

fn abort_entry(registry: &Registry, path: &Path, err: &DispatchError) {
    if registry.status_of(path) != Some(EntryStatus::Processing) {
        return;
    }
    let reason = format!("dispatch aborted: {err}");
    if registry.fail(path, &reason).is_ok() {
        warn!(target: "intake::schedule", path = %path.display(), "{reason}");
    }
}

/// Remove empty directories from `file`'s parent upwards, stopping at the
/// first non-empty one and never touching `root` itself.
pub async fn prune_empty_ancestors(file: &Path, root: &Path) -> usize {
    let mut removed = 0;
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => {
                trace!(target: "intake::schedule", dir = %dir.display(), "pruned empty directory");
                removed += 1;
                current = dir.parent();
            }
            Err(_) => break,
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::dispatch::PoolConfig;
    use crate::error::ProcessorError;
    use crate::processor::{FileProcessor, ProcessRequest, ProcessorBinding, ProcessorTable};
    use crate::sidecar::sidecar_path_for;

    #[derive(Default)]
    struct FakeChecker {
        verdicts: Mutex<HashMap<PathBuf, Availability>>,
    }

    impl FakeChecker {
        fn set(&self, path: &Path, verdict: Availability) {
            self.verdicts.lock().unwrap().insert(path.to_path_buf(), verdict);
        }
    }

    #[async_trait]
    impl AvailabilityChecker for FakeChecker {
        async fn check(&self, path: &Path) -> Result<Availability, AvailabilityError> {
            if !path.exists() {
                return Err(AvailabilityError::Missing(path.to_path_buf()));
            }
            Ok(self
                .verdicts
                .lock()
                .unwrap()
                .get(path)
                .copied()
                .unwrap_or(Availability::Available))
        }
    }

    struct FailNamed(&'static str);

    #[async_trait]
    impl FileProcessor for FailNamed {
        async fn process(&self, request: &ProcessRequest) -> Result<(), ProcessorError> {
            if request.source.file_name().is_some_and(|n| n == self.0) {
                return Err(ProcessorError::Other(format!("cannot handle {}", self.0)));
            }
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        registry: Arc<Registry>,
        checker: Arc<FakeChecker>,
        scheduler: ReconciliationScheduler,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempdir().unwrap();
            let root = tmp.path().join("inbox");
            let scratch = tmp.path().join("scratch");
            std::fs::create_dir_all(&root).unwrap();
            std::fs::create_dir_all(&scratch).unwrap();

            let registry = Arc::new(Registry::new());
            let checker = Arc::new(FakeChecker::default());
            let table = ProcessorTable::new(vec![ProcessorBinding::new(
                root.clone(),
                "test",
                Arc::new(FailNamed("bad.dat")),
            )])
            .unwrap();
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::clone(&registry),
                Arc::new(table),
                scratch,
                PoolConfig::default(),
            ));
            let scheduler =
                ReconciliationScheduler::new(Arc::clone(&registry), checker.clone(), dispatcher);
            Self {
                _tmp: tmp,
                root,
                registry,
                checker,
                scheduler,
            }
        }

        fn add(&self, relative: &str) -> PathBuf {
            let path = self.root.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, relative.as_bytes()).unwrap();
            self.registry.discover(path.clone());
            path
        }

        async fn run_cycle(&self) {
            self.scheduler.promote_pending().await;
            self.scheduler.dispatch_ready().await;
            self.scheduler.dispatcher.shutdown().await;
            self.scheduler.wait_for_observers().await;
            self.scheduler.sweep_processed().await;
            self.scheduler.sweep_failed().await;
        }
    }

    #[tokio::test]
    async fn processed_file_is_deleted_and_album_pruned() {
        let fx = Fixture::new();
        let track = fx.add("album/track.dat");

        fx.run_cycle().await;

        assert!(!track.exists());
        assert!(!fx.root.join("album").exists());
        assert!(fx.root.exists());
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn prune_stops_at_non_empty_directory() {
        let fx = Fixture::new();
        let track = fx.add("album/cd1/track.dat");
        std::fs::write(fx.root.join("album/cover.jpg"), b"x").unwrap();

        fx.run_cycle().await;

        assert!(!track.exists());
        assert!(!fx.root.join("album/cd1").exists());
        assert!(fx.root.join("album").exists());
    }

    #[tokio::test]
    async fn failed_file_gets_sidecar_and_stays() {
        let fx = Fixture::new();
        let bad = fx.add("bad.dat");

        fx.run_cycle().await;

        assert_eq!(std::fs::read(&bad).unwrap(), b"bad.dat");
        let sidecar = std::fs::read_to_string(sidecar_path_for(&bad)).unwrap();
        assert!(sidecar.starts_with(&format!("{} (ERROR)", bad.display())));
        assert!(sidecar.contains("Changed to status PROCESSING"));
        assert!(sidecar.contains("ERROR: processor 'test' failed: cannot handle bad.dat"));
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn busy_file_stays_pending() {
        let fx = Fixture::new();
        let busy = fx.add("busy.dat");
        fx.checker.set(&busy, Availability::InUse);

        let report = fx.scheduler.promote_pending().await;

        assert_eq!(report, TickReport { examined: 1, advanced: 0, failed: 0 });
        assert_eq!(fx.registry.status_of(&busy), Some(EntryStatus::Pending));
    }

    #[tokio::test]
    async fn availability_timeout_yields_exactly_one_sidecar() {
        let fx = Fixture::new();
        let stuck = fx.add("stuck.dat");
        fx.checker.set(
            &stuck,
            Availability::TimedOut {
                waited: Duration::from_secs(360),
            },
        );

        fx.scheduler.promote_pending().await;
        fx.scheduler.promote_pending().await;
        assert_eq!(fx.registry.status_of(&stuck), Some(EntryStatus::Error));
        let errors = fx
            .registry
            .get(&stuck)
            .unwrap()
            .events()
            .iter()
            .filter(|e| e.message.starts_with("ERROR: "))
            .count();
        assert_eq!(errors, 1);

        let first = fx.scheduler.sweep_failed().await;
        let second = fx.scheduler.sweep_failed().await;
        assert_eq!(first.advanced, 1);
        assert_eq!(second.examined, 0);

        let sidecars: Vec<_> = std::fs::read_dir(&fx.root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".err"))
            .collect();
        assert_eq!(sidecars.len(), 1);
        let text = std::fs::read_to_string(sidecar_path_for(&stuck)).unwrap();
        assert!(text.contains("file remained in use for 360s"));
    }

    #[tokio::test]
    async fn vanished_pending_file_is_forgotten() {
        let fx = Fixture::new();
        let gone = fx.add("partial.dat");
        std::fs::remove_file(&gone).unwrap();

        let report = fx.scheduler.promote_pending().await;

        assert_eq!(report.advanced, 1);
        assert!(!fx.registry.contains(&gone));
    }

    #[tokio::test]
    async fn dispatch_ignores_entries_not_ready() {
        let fx = Fixture::new();
        fx.add("a.dat");

        let report = fx.scheduler.dispatch_ready().await;

        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn closed_pool_forces_error() {
        let fx = Fixture::new();
        let path = fx.add("late.dat");
        fx.scheduler.promote_pending().await;
        fx.scheduler.dispatcher.shutdown().await;

        let report = fx.scheduler.dispatch_ready().await;

        assert_eq!(report.failed, 1);
        let entry = fx.registry.get(&path).unwrap();
        assert_eq!(entry.status(), EntryStatus::Error);
        assert!(entry.events().iter().any(|e| e.message.contains("dispatch aborted")));
    }

    struct NeverSettles;

    #[async_trait]
    impl AvailabilityChecker for NeverSettles {
        async fn check(&self, _path: &Path) -> Result<Availability, AvailabilityError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_blocked_promote_tick() {
        let fx = Fixture::new();
        fx.add("held.dat");
        let scheduler = Arc::new(
            ReconciliationScheduler::new(
                Arc::clone(&fx.registry),
                Arc::new(NeverSettles),
                Arc::clone(&fx.scheduler.dispatcher),
            )
            .with_period(Duration::from_millis(10)),
        );
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        scheduler.spawn(&tracker, &shutdown);
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tracker.close();

        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("ticks stop promptly");
        assert_eq!(fx.registry.status_of(&fx.root.join("held.dat")), Some(EntryStatus::Pending));
    }

    #[tokio::test]
    async fn prune_never_removes_root() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("a/b")).unwrap();

        let removed = prune_empty_ancestors(&root.join("a/b/file.dat"), &root).await;

        assert_eq!(removed, 2);
        assert!(root.exists());
    }
}
