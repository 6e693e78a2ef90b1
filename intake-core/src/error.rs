use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::entry::EntryStatus;

/// A directory could not be registered with the watcher.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to watch {path}: {source}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to create filesystem watcher: {0}")]
    Init(#[source] notify::Error),
}

#[derive(Error, Debug)]
pub enum AvailabilityError {
    #[error("file {0} no longer exists")]
    Missing(PathBuf),

    #[error("availability probe for {path} failed: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: RunnerError,
    },

    #[error("IO error while checking {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raised while building the processor table from configured bindings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("roots {outer} and {inner} overlap; each file must resolve to exactly one processor")]
    OverlappingRoots { outer: PathBuf, inner: PathBuf },

    #[error("no processor bindings configured")]
    Empty,

    #[error("root {0} must be an absolute path")]
    RelativeRoot(PathBuf),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no configured root contains {0}")]
    NotBound(PathBuf),

    #[error("failed to stage {source_path} into {staged_path}: {error}")]
    Staging {
        source_path: PathBuf,
        staged_path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("processor '{processor}' failed: {error}")]
    Capability {
        processor: String,
        #[source]
        error: ProcessorError,
    },

    #[error("processor '{0}' panicked")]
    Panicked(String),

    #[error("dispatch aborted before reporting an outcome")]
    Aborted,

    #[error("worker pool is shut down")]
    PoolClosed,
}

/// Failure reported by a processing capability.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("command `{command}` exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("recovery marker {0} already exists; a previous move was never completed")]
    MarkerExists(PathBuf),

    #[error("recovery marker {0} is empty")]
    EmptyMarker(PathBuf),

    #[error("marker {marker} points at {destination}, which does not exist and the original is gone too")]
    Unresolvable {
        marker: PathBuf,
        destination: PathBuf,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{path}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        path: PathBuf,
        from: EntryStatus,
        to: EntryStatus,
    },

    #[error("no registry entry for {0}")]
    NotFound(PathBuf),
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Crate level error aggregating every concern above.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Availability(#[from] AvailabilityError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IntakeError>;
