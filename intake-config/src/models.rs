use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_CORE_WORKERS: usize = 2;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(360);
pub const DEFAULT_LSOF_PROGRAM: &str = "lsof";

/// Fully resolved daemon configuration. All paths are absolute.
#[derive(Debug, Clone)]
pub struct Config {
    pub scratch_dir: PathBuf,
    pub tick_period: Duration,
    pub workers: WorkerConfig,
    pub availability: AvailabilityConfig,
    pub status: Option<StatusConfig>,
    pub bindings: Vec<BindingConfig>,
    pub processors: BTreeMap<String, ProcessorConfig>,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.bindings.iter().map(|binding| binding.root.as_path())
    }

    pub fn processor(&self, id: &str) -> Option<&ProcessorConfig> {
        self.processors.get(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerConfig {
    pub core: usize,
    pub max: usize,
    pub queue_capacity: usize,
    #[serde(with = "duration_text")]
    pub idle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            core: DEFAULT_CORE_WORKERS,
            max: DEFAULT_MAX_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// How stability of a discovered file is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityPolicy {
    /// One `lsof -t` probe per promote tick.
    #[default]
    Lsof,
    /// Non-blocking exclusive lock with bounded retries inside one check.
    ExclusiveLock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityConfig {
    pub policy: AvailabilityPolicy,
    #[serde(with = "duration_text")]
    pub retry_interval: Duration,
    #[serde(with = "duration_text")]
    pub total_timeout: Duration,
    pub lsof_program: String,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            policy: AvailabilityPolicy::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            lsof_program: DEFAULT_LSOF_PROGRAM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingConfig {
    pub root: PathBuf,
    pub processor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProcessorConfig {
    /// Accept every file and do nothing with it.
    Discard,
    Archive(ArchiveConfig),
}

impl ProcessorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorConfig::Discard => "discard",
            ProcessorConfig::Archive(_) => "archive",
        }
    }
}

/// Move files into a library tree, optionally producing converted copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveConfig {
    pub destination: PathBuf,
    /// Lower-case extensions without the dot. Empty means every file.
    pub extensions: Vec<String>,
    pub convert: Vec<ConvertStep>,
}

/// One external conversion run on the staged copy. `{input}` and `{output}`
/// in `args` are replaced with the staged path and the target path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertStep {
    pub program: String,
    pub args: Vec<String>,
    pub extension: String,
    pub destination: PathBuf,
    #[serde(with = "duration_text::option")]
    pub timeout: Option<Duration>,
}

/// Where the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// `--config` on the command line or an explicit loader path.
    Explicit,
    /// `$INTAKE_CONFIG`.
    Env,
    /// One of the default file locations.
    DefaultLocation,
    /// Parsed from an in-memory string.
    #[default]
    Inline,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigMetadata {
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}

pub(crate) mod duration_text {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub mod option {
        use std::time::Duration;

        use serde::Serializer;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }
    }
}
