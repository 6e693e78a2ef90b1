use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::AvailabilityPolicy;

/// Raw configuration as written in a TOML (or JSON) file. Durations are
/// human readable strings such as `"5s"` or `"6m"`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_period: Option<String>,
    #[serde(default)]
    pub workers: FileWorkerConfig,
    #[serde(default)]
    pub availability: FileAvailabilityConfig,
    pub status: Option<FileStatusConfig>,
    #[serde(default)]
    pub bindings: Vec<FileBindingConfig>,
    #[serde(default)]
    pub processors: BTreeMap<String, FileProcessorConfig>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAvailabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<AvailabilityPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsof_program: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileStatusConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileBindingConfig {
    pub root: PathBuf,
    pub processor: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FileProcessorConfig {
    Discard,
    Archive {
        destination: PathBuf,
        #[serde(default)]
        extensions: Vec<String>,
        #[serde(default)]
        convert: Vec<FileConvertStep>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileConvertStep {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub extension: String,
    pub destination: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}
