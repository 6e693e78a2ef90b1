//! Startup ordering and shutdown for the whole pipeline.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::availability::AvailabilityChecker;
use crate::dispatch::{Dispatcher, PoolConfig, purge_scratch};
use crate::error::{IntakeError, Result};
use crate::processor::ProcessorTable;
use crate::recovery::{RecoveryReport, recover};
use crate::registry::Registry;
use crate::scheduler::{DEFAULT_TICK_PERIOD, ReconciliationScheduler};
use crate::status::StatusSnapshot;
use crate::watch::{DirectoryWatcher, TreeRegistration};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub scratch_dir: PathBuf,
    pub tick_period: Duration,
    pub pool: PoolConfig,
    pub promote_concurrency: usize,
}

impl RuntimeConfig {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            tick_period: DEFAULT_TICK_PERIOD,
            pool: PoolConfig::default(),
            promote_concurrency: 8,
        }
    }
}

/// A running watch -> stabilize -> dispatch -> sweep pipeline.
pub struct IntakeRuntime {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    table: Arc<ProcessorTable>,
    watcher: Arc<DirectoryWatcher>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<ReconciliationScheduler>,
    recovery: RecoveryReport,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for IntakeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntakeRuntime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("watcher", &self.watcher)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl IntakeRuntime {
    /// Bring the pipeline up:
    ///
    /// 1. replay leftover recovery markers under every root,
    /// 2. empty the scratch directory,
    /// 3. walk and subscribe every root, registering existing files,
    /// 4. start the watcher loop and the scheduler ticks.
    pub async fn start(
        table: ProcessorTable,
        checker: Arc<dyn AvailabilityChecker>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let roots = table.roots();

        let recovery = recover(&roots).await;
        if recovery.failed > 0 {
            warn!(target: "intake::recovery", failed = recovery.failed, "some markers could not be resolved and were left in place");
        }

        let purged = purge_scratch(&config.scratch_dir).await?;
        info!(scratch = %config.scratch_dir.display(), purged, "scratch directory ready");

        let registry = Arc::new(Registry::new());
        let watcher = Arc::new(DirectoryWatcher::new(Arc::clone(&registry))?);
        for root in &roots {
            let registration = register_root(&watcher, root.clone()).await?;
            info!(
                target: "intake::watch",
                root = %root.display(),
                directories = registration.directories,
                discovered = registration.discovered,
                errors = registration.errors,
                "root registered"
            );
        }

        let table = Arc::new(table);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&table),
            config.scratch_dir.clone(),
            config.pool,
        ));
        let scheduler = Arc::new(
            ReconciliationScheduler::new(Arc::clone(&registry), checker, Arc::clone(&dispatcher))
                .with_watcher(Arc::clone(&watcher))
                .with_period(config.tick_period)
                .with_promote_concurrency(config.promote_concurrency),
        );

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(Arc::clone(&watcher).run(shutdown.clone()));
        scheduler.spawn(&tasks, &shutdown);

        info!(
            roots = roots.len(),
            tracked = registry.len(),
            "intake runtime started"
        );

        Ok(Self {
            config,
            registry,
            table,
            watcher,
            dispatcher,
            scheduler,
            recovery,
            shutdown,
            tasks,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn watcher(&self) -> &Arc<DirectoryWatcher> {
        &self.watcher
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Markers handled during startup.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Token that stops the watcher and ticks when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_handle().snapshot()
    }

    /// Cloneable handle for code that outlives a borrow of the runtime,
    /// such as HTTP handlers.
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.table),
            dispatcher: Arc::clone(&self.dispatcher),
            scratch_dir: self.config.scratch_dir.clone(),
            tick_period: self.config.tick_period,
        }
    }

    /// Stop the watcher and the ticks, then let queued and in-flight
    /// dispatches finish.
    pub async fn shutdown(self) {
        info!("intake runtime shutting down");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.dispatcher.shutdown().await;
        self.scheduler.wait_for_observers().await;
        info!(tracked = self.registry.len(), "intake runtime stopped");
    }
}

#[derive(Clone)]
pub struct StatusHandle {
    registry: Arc<Registry>,
    table: Arc<ProcessorTable>,
    dispatcher: Arc<Dispatcher>,
    scratch_dir: PathBuf,
    tick_period: Duration,
}

impl fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusHandle")
            .field("scratch_dir", &self.scratch_dir)
            .field("tick_period", &self.tick_period)
            .finish_non_exhaustive()
    }
}

impl StatusHandle {
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::capture(
            &self.registry,
            &self.table,
            self.dispatcher.pool(),
            self.scratch_dir.clone(),
            self.tick_period,
        )
    }
}

async fn register_root(watcher: &Arc<DirectoryWatcher>, root: PathBuf) -> Result<TreeRegistration> {
    let watcher = Arc::clone(watcher);
    spawn_blocking(move || watcher.watch_root(&root))
        .await
        .map_err(|join_err| IntakeError::Internal(format!("root walk failed: {join_err}")))
}
