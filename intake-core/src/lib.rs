//! # Intake Core
//!
//! Watches inbox directories, waits until each arriving file has stopped
//! being written, and hands it exactly once to the processing capability
//! bound to its root.
//!
//! ## Overview
//!
//! - **Discovery**: per-directory filesystem subscriptions plus a startup
//!   tree walk feed `Pending` entries into the [`registry`]
//! - **Stabilization**: an explicit [`availability`] policy decides when a
//!   file has no active writer left
//! - **Dispatch**: claimed entries are staged into a scratch directory and
//!   run through their [`processor`] on a bounded worker pool
//! - **Sweep**: processed sources are deleted and their emptied directories
//!   pruned; failed ones get a diagnostic sidecar
//! - **Recovery**: destructive moves are journaled by marker files and undone
//!   at the next startup if the process died mid-way
//!
//! ## Architecture
//!
//! - [`entry`]: per-file state machine
//! - [`watch`]: directory watcher and tree walk
//! - [`dispatch`]: staging, worker pool and the dispatcher
//! - [`scheduler`]: periodic reconciliation ticks
//! - [`recovery`]: marker-file protocol
//! - [`runtime`]: startup ordering and shutdown
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use intake_core::{
//!     ExclusiveLock, FileProcessor, IntakeRuntime, ProcessRequest, ProcessorBinding,
//!     ProcessorError, ProcessorTable, RuntimeConfig,
//! };
//!
//! struct Print;
//!
//! #[async_trait]
//! impl FileProcessor for Print {
//!     async fn process(&self, request: &ProcessRequest) -> Result<(), ProcessorError> {
//!         println!("{}", request.source.display());
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> intake_core::Result<()> {
//!     let table = ProcessorTable::new(vec![ProcessorBinding::new(
//!         "/srv/inbox",
//!         "print",
//!         Arc::new(Print),
//!     )])?;
//!     let runtime = IntakeRuntime::start(
//!         table,
//!         Arc::new(ExclusiveLock::default()),
//!         RuntimeConfig::new("/var/tmp/intake"),
//!     )
//!     .await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

/// Availability policies deciding when a file has settled
pub mod availability;

/// Dispatcher, staging and worker pool
pub mod dispatch;

/// File entries and their status state machine
pub mod entry;

/// Error types for every pipeline concern
pub mod error;

/// Processing capabilities and the root binding table
pub mod processor;

/// Marker-file crash recovery
pub mod recovery;

/// Concurrent entry registry
pub mod registry;

/// External program execution
pub mod runner;

/// Startup and shutdown of the full pipeline
pub mod runtime;

/// Periodic reconciliation ticks
pub mod scheduler;

/// Diagnostic sidecar files
pub mod sidecar;

/// Serializable status view
pub mod status;

/// Directory watcher and tree walk
pub mod watch;

pub use availability::{Availability, AvailabilityChecker, ExclusiveLock, LsofProbe};
pub use dispatch::{DispatchHandle, DispatchOutcome, Dispatcher, PoolConfig, WorkerPool};
pub use entry::{EntryEvent, EntryStatus, FileEntry};
pub use error::{
    AvailabilityError, BindingError, DiscoveryError, DispatchError, IntakeError, ProcessorError,
    RecoveryError, RegistryError, Result, RunnerError,
};
pub use processor::{
    FileProcessor, ProcessRequest, ProcessorBinding, ProcessorTable, normalize_path,
};
pub use recovery::{PendingMove, RecoveryReport, begin_move, recover};
pub use registry::Registry;
pub use runner::{CommandOutput, CommandSpec, ProcessRunner, TokioProcessRunner};
pub use runtime::{IntakeRuntime, RuntimeConfig, StatusHandle};
pub use scheduler::{ReconciliationScheduler, Tick, TickReport};
pub use status::StatusSnapshot;
pub use watch::{DirectoryWatcher, TreeRegistration, WatchHandle};
