//! Runs claimed entries through their bound capability.
//!
//! For each `Processing` entry the dispatcher resolves the binding, stages a
//! private copy in the scratch directory, invokes the capability on it and
//! records the terminal state. The staged copy is always removed afterwards.
//! Work runs on a [`WorkerPool`]; [`Dispatcher::submit`] hands back a
//! [`DispatchHandle`] that resolves once the outcome is recorded.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::entry::EntryStatus;
use crate::error::DispatchError;
use crate::processor::{ProcessRequest, ProcessorBinding, ProcessorTable};
use crate::registry::Registry;

pub mod pool;
pub mod staging;

pub use pool::{Job, PoolConfig, WorkerPool};
pub use staging::{Stager, purge_scratch};

/// Result of one dispatch, as recorded in the registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    Processed,
    Failed { error: String },
}

impl DispatchOutcome {
    pub fn status(&self) -> EntryStatus {
        match self {
            DispatchOutcome::Processed => EntryStatus::Processed,
            DispatchOutcome::Failed { .. } => EntryStatus::Error,
        }
    }
}

/// Completion handle for a submitted dispatch.
#[derive(Debug)]
pub struct DispatchHandle {
    path: PathBuf,
    outcome: oneshot::Receiver<DispatchOutcome>,
}

impl DispatchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the outcome. [`DispatchError::Aborted`] means the job was
    /// dropped without reporting one.
    pub async fn wait(self) -> Result<DispatchOutcome, DispatchError> {
        self.outcome.await.map_err(|_| DispatchError::Aborted)
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    table: Arc<ProcessorTable>,
    stager: Stager,
    pool: WorkerPool,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stager", &self.stager)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Must be called from within a tokio runtime; the pool's core workers
    /// start immediately.
    pub fn new(
        registry: Arc<Registry>,
        table: Arc<ProcessorTable>,
        scratch_dir: impl Into<PathBuf>,
        pool: PoolConfig,
    ) -> Self {
        Self {
            registry,
            table,
            stager: Stager::new(scratch_dir),
            pool: WorkerPool::new(pool),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn scratch_dir(&self) -> &Path {
        self.stager.scratch_dir()
    }

    pub fn table(&self) -> &ProcessorTable {
        &self.table
    }

    /// Queue an already claimed entry. Awaits while the pool is saturated.
    pub async fn submit(self: &Arc<Self>, path: PathBuf) -> Result<DispatchHandle, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        let job_path = path.clone();
        self.pool
            .submit(Box::pin(async move {
                let outcome = this.process_claimed(&job_path).await;
                let _ = tx.send(outcome);
            }))
            .await?;
        Ok(DispatchHandle { path, outcome: rx })
    }

    /// Process one `Processing` entry inline and record the outcome.
    pub async fn process_claimed(&self, path: &Path) -> DispatchOutcome {
        let result = match self.table.resolve(path) {
            Some(binding) => self.stage_and_invoke(binding, path).await,
            None => Err(DispatchError::NotBound(path.to_path_buf())),
        };

        match result {
            Ok(()) => {
                if let Err(err) =
                    self.registry
                        .transition(path, EntryStatus::Processing, EntryStatus::Processed)
                {
                    warn!(target: "intake::dispatch", path = %path.display(), error = %err, "could not record success");
                }
                info!(target: "intake::dispatch", path = %path.display(), "processed");
                DispatchOutcome::Processed
            }
            Err(err) => {
                let error = err.to_string();
                if let Err(reg_err) = self.registry.fail(path, &error) {
                    warn!(target: "intake::dispatch", path = %path.display(), error = %reg_err, "could not record failure");
                }
                warn!(target: "intake::dispatch", path = %path.display(), %error, "processing failed");
                DispatchOutcome::Failed { error }
            }
        }
    }

    async fn stage_and_invoke(
        &self,
        binding: &ProcessorBinding,
        path: &Path,
    ) -> Result<(), DispatchError> {
        let staged = self.stager.stage(path).await?;
        self.registry.set_temp_path(path, Some(staged.clone()));

        let request = ProcessRequest {
            source: path.to_path_buf(),
            staged: staged.clone(),
            root: binding.root.clone(),
        };
        self.registry
            .log(path, format!("Processing with '{}'", binding.id));
        debug!(target: "intake::dispatch", path = %path.display(), processor = %binding.id, "invoking processor");

        let result = match AssertUnwindSafe(binding.processor.process(&request))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(DispatchError::Capability {
                processor: binding.id.clone(),
                error,
            }),
            Err(_) => Err(DispatchError::Panicked(binding.id.clone())),
        };

        self.stager.discard(&staged).await;
        self.registry.set_temp_path(path, None);
        result
    }

    /// Stop accepting work and wait for queued and running dispatches.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::error::ProcessorError;
    use crate::processor::FileProcessor;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<ProcessRequest>>,
        staged_bytes: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl FileProcessor for Recording {
        async fn process(&self, request: &ProcessRequest) -> Result<(), ProcessorError> {
            self.staged_bytes
                .lock()
                .unwrap()
                .push(std::fs::read(&request.staged)?);
            self.seen.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl FileProcessor for Failing {
        async fn process(&self, _request: &ProcessRequest) -> Result<(), ProcessorError> {
            Err(ProcessorError::Other("decoder rejected input".into()))
        }
    }

    struct Panicking;

    fn explode() {
        panic!("capability blew up");
    }

    #[async_trait]
    impl FileProcessor for Panicking {
        async fn process(&self, _request: &ProcessRequest) -> Result<(), ProcessorError> {
            explode();
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        scratch: PathBuf,
        registry: Arc<Registry>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempdir().unwrap();
            let root = tmp.path().join("inbox");
            let scratch = tmp.path().join("scratch");
            std::fs::create_dir_all(&root).unwrap();
            std::fs::create_dir_all(&scratch).unwrap();
            Self {
                _tmp: tmp,
                root,
                scratch,
                registry: Arc::new(Registry::new()),
            }
        }

        fn dispatcher(&self, processor: Arc<dyn FileProcessor>) -> Arc<Dispatcher> {
            let table = ProcessorTable::new(vec![ProcessorBinding::new(
                self.root.clone(),
                "test",
                processor,
            )])
            .unwrap();
            Arc::new(Dispatcher::new(
                Arc::clone(&self.registry),
                Arc::new(table),
                self.scratch.clone(),
                PoolConfig::default(),
            ))
        }

        fn claimed_file(&self, name: &str, body: &[u8]) -> PathBuf {
            let path = self.root.join(name);
            std::fs::write(&path, body).unwrap();
            self.registry.discover(path.clone());
            self.registry
                .transition(&path, EntryStatus::Pending, EntryStatus::Ready)
                .unwrap();
            assert!(self.registry.claim(&path));
            path
        }

        fn scratch_is_empty(&self) -> bool {
            std::fs::read_dir(&self.scratch).unwrap().next().is_none()
        }
    }

    #[tokio::test]
    async fn success_stages_copy_and_marks_processed() {
        let fx = Fixture::new();
        let recorder = Arc::new(Recording::default());
        let dispatcher = fx.dispatcher(recorder.clone());
        let path = fx.claimed_file("a.dat", b"payload");

        let outcome = dispatcher.submit(path.clone()).await.unwrap().wait().await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Processed);
        assert_eq!(fx.registry.status_of(&path), Some(EntryStatus::Processed));
        assert_eq!(recorder.staged_bytes.lock().unwrap()[0], b"payload");
        let request = recorder.seen.lock().unwrap()[0].clone();
        assert_eq!(request.source, path);
        assert_eq!(request.root, fx.root);
        assert_eq!(request.staged.extension().unwrap(), "dat");
        assert!(fx.scratch_is_empty());
        assert!(fx.registry.get(&path).unwrap().temp_path().is_none());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn capability_error_marks_error_and_keeps_source() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(Arc::new(Failing));
        let path = fx.claimed_file("bad.dat", b"bad");

        let outcome = dispatcher.process_claimed(&path).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { ref error } if error.contains("decoder rejected input")));
        let entry = fx.registry.get(&path).unwrap();
        assert_eq!(entry.status(), EntryStatus::Error);
        assert!(entry.events().iter().any(|e| e.message.starts_with("ERROR: ")));
        assert_eq!(std::fs::read(&path).unwrap(), b"bad");
        assert!(fx.scratch_is_empty());
    }

    #[tokio::test]
    async fn panic_is_contained_at_dispatch_boundary() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(Arc::new(Panicking));
        let path = fx.claimed_file("boom.dat", b"x");

        let outcome = dispatcher.submit(path.clone()).await.unwrap().wait().await.unwrap();

        assert_eq!(outcome.status(), EntryStatus::Error);
        assert_eq!(fx.registry.status_of(&path), Some(EntryStatus::Error));
        assert!(fx.scratch_is_empty());

        // Pool keeps serving after the panic.
        let ok = Arc::new(Recording::default());
        let other = fx.dispatcher(ok);
        let next = fx.claimed_file("fine.dat", b"y");
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            other.submit(next).await.unwrap().wait(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome, DispatchOutcome::Processed);
    }

    #[tokio::test]
    async fn staging_failure_marks_error() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(Arc::new(Recording::default()));
        let path = fx.claimed_file("vanishing.dat", b"x");
        std::fs::remove_file(&path).unwrap();

        let outcome = dispatcher.process_claimed(&path).await;

        assert_eq!(outcome.status(), EntryStatus::Error);
        assert_eq!(fx.registry.status_of(&path), Some(EntryStatus::Error));
    }

    #[tokio::test]
    async fn unbound_path_marks_error() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(Arc::new(Recording::default()));
        let stray = fx.scratch.parent().unwrap().join("stray.dat");
        std::fs::write(&stray, b"x").unwrap();
        fx.registry.discover(stray.clone());
        fx.registry
            .transition(&stray, EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();
        fx.registry.claim(&stray);

        let outcome = dispatcher.process_claimed(&stray).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { ref error } if error.contains("no configured root")));
    }
}
