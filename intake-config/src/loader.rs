use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use intake_core::normalize_path;
use thiserror::Error;
use tracing::debug;

use crate::models::{
    ArchiveConfig, AvailabilityConfig, BindingConfig, Config, ConfigMetadata, ConfigSource,
    ConvertStep, DEFAULT_IDLE_TIMEOUT, DEFAULT_RETRY_INTERVAL, DEFAULT_TICK_PERIOD,
    DEFAULT_TOTAL_TIMEOUT, ProcessorConfig, StatusConfig, WorkerConfig,
};
use crate::sources::{FileConfig, FileConvertStep, FileProcessorConfig};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "INTAKE_CONFIG";

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["intake.toml", "config/intake.toml"];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error(
        "no configuration found; pass --config, set {CONFIG_PATH_ENV}, or create ./intake.toml"
    )]
    NoConfig,
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration {
        field: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid status bind address '{value}'")]
    InvalidBind {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("cannot determine the current directory")]
    CurrentDir(#[source] std::io::Error),
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

/// A validated configuration plus the non-fatal findings about it.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` handling entirely.
    pub skip_env_file: bool,
}

/// Resolves, reads and validates the configuration.
///
/// The file is taken from, in order: an explicit path, `$INTAKE_CONFIG`,
/// then the first existing default location (`./intake.toml`,
/// `./config/intake.toml`). Relative paths inside the file are resolved
/// against the file's directory, and every path is normalised with
/// [`normalize_path`] before validation.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.options.skip_env_file = true;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;

        let (path, source) = self.resolve_path()?;
        let contents = fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
            path: path.clone(),
            source: err,
        })?;
        let file_config = parse_file_config(&contents, &path)?;

        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => absolute(parent)?,
            _ => env::current_dir().map_err(ConfigLoadError::CurrentDir)?,
        };
        let metadata = ConfigMetadata {
            path: Some(absolute(&path)?),
            source,
            env_file_loaded,
        };
        debug!(
            path = %path.display(),
            source = ?metadata.source,
            "configuration file resolved"
        );
        compose(file_config, &base_dir, metadata)
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            other => Err(ConfigLoadError::EnvFile(other)),
        })
    }

    fn resolve_path(&self) -> Result<(PathBuf, ConfigSource), ConfigLoadError> {
        if let Some(explicit) = &self.options.config_path {
            return existing(explicit.clone(), ConfigSource::Explicit);
        }
        if let Ok(from_env) = env::var(CONFIG_PATH_ENV)
            && !from_env.trim().is_empty()
        {
            return existing(PathBuf::from(from_env), ConfigSource::Env);
        }
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists())
            .map(|path| (path, ConfigSource::DefaultLocation))
            .ok_or(ConfigLoadError::NoConfig)
    }
}

/// Parse and validate configuration text. Relative paths are resolved
/// against `base_dir`.
pub fn load_from_str(contents: &str, base_dir: &Path) -> Result<ConfigLoad, ConfigLoadError> {
    let file_config = parse_toml(contents, "inline")?;
    compose(
        file_config,
        base_dir,
        ConfigMetadata {
            path: None,
            source: ConfigSource::Inline,
            env_file_loaded: false,
        },
    )
}

fn existing(path: PathBuf, source: ConfigSource) -> Result<(PathBuf, ConfigSource), ConfigLoadError> {
    if path.exists() {
        Ok((path, source))
    } else {
        Err(ConfigLoadError::MissingConfig { path })
    }
}

fn parse_file_config(contents: &str, path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let origin = path.display().to_string();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(contents).map_err(|err| ConfigLoadError::Parse {
            origin,
            message: err.to_string(),
        }),
        _ => parse_toml(contents, &origin),
    }
}

fn parse_toml(contents: &str, origin: &str) -> Result<FileConfig, ConfigLoadError> {
    toml::from_str(contents).map_err(|err| ConfigLoadError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}

fn compose(
    file: FileConfig,
    base_dir: &Path,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let FileConfig {
        scratch_dir,
        tick_period,
        workers: file_workers,
        availability: file_availability,
        status: file_status,
        bindings: file_bindings,
        processors: file_processors,
    } = file;

    let resolve = |path: PathBuf| -> PathBuf {
        if path.is_absolute() {
            normalize_path(&path)
        } else {
            normalize_path(&base_dir.join(path))
        }
    };

    let scratch_dir = scratch_dir
        .map(&resolve)
        .unwrap_or_else(|| env::temp_dir().join("intake"));

    let tick_period = duration_or("tick_period", tick_period, DEFAULT_TICK_PERIOD)?;

    let worker_defaults = WorkerConfig::default();
    let workers = WorkerConfig {
        core: file_workers.core.unwrap_or(worker_defaults.core),
        max: file_workers.max.unwrap_or(worker_defaults.max),
        queue_capacity: file_workers
            .queue_capacity
            .unwrap_or(worker_defaults.queue_capacity),
        idle_timeout: duration_or(
            "workers.idle_timeout",
            file_workers.idle_timeout,
            DEFAULT_IDLE_TIMEOUT,
        )?,
    };

    let availability_defaults = AvailabilityConfig::default();
    let availability = AvailabilityConfig {
        policy: file_availability
            .policy
            .unwrap_or(availability_defaults.policy),
        retry_interval: duration_or(
            "availability.retry_interval",
            file_availability.retry_interval,
            DEFAULT_RETRY_INTERVAL,
        )?,
        total_timeout: duration_or(
            "availability.total_timeout",
            file_availability.total_timeout,
            DEFAULT_TOTAL_TIMEOUT,
        )?,
        lsof_program: file_availability
            .lsof_program
            .unwrap_or(availability_defaults.lsof_program),
    };

    let status = file_status
        .map(|status| {
            status
                .bind
                .parse::<SocketAddr>()
                .map(|bind| StatusConfig { bind })
                .map_err(|source| ConfigLoadError::InvalidBind {
                    value: status.bind.clone(),
                    source,
                })
        })
        .transpose()?;

    let bindings = file_bindings
        .into_iter()
        .map(|binding| BindingConfig {
            root: resolve(binding.root),
            processor: binding.processor,
        })
        .collect();

    let mut processors = BTreeMap::new();
    for (id, processor) in file_processors {
        let resolved = match processor {
            FileProcessorConfig::Discard => ProcessorConfig::Discard,
            FileProcessorConfig::Archive {
                destination,
                extensions,
                convert,
            } => ProcessorConfig::Archive(ArchiveConfig {
                destination: resolve(destination),
                extensions: extensions
                    .into_iter()
                    .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                    .collect(),
                convert: convert
                    .into_iter()
                    .enumerate()
                    .map(|(index, step)| convert_step(&id, index, step, &resolve))
                    .collect::<Result<_, _>>()?,
            }),
        };
        processors.insert(id, resolved);
    }

    let config = Config {
        scratch_dir,
        tick_period,
        workers,
        availability,
        status,
        bindings,
        processors,
        metadata,
    };
    let warnings = validation::apply_guard_rails(&config)?;
    Ok(ConfigLoad { config, warnings })
}

fn convert_step(
    processor: &str,
    index: usize,
    step: FileConvertStep,
    resolve: &impl Fn(PathBuf) -> PathBuf,
) -> Result<ConvertStep, ConfigLoadError> {
    let timeout = step
        .timeout
        .map(|raw| parse_duration(&format!("processors.{processor}.convert[{index}].timeout"), raw))
        .transpose()?;
    Ok(ConvertStep {
        program: step.program,
        args: step.args,
        extension: step.extension.trim_start_matches('.').to_string(),
        destination: resolve(step.destination),
        timeout,
    })
}

fn duration_or(
    field: &str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw {
        Some(raw) => parse_duration(field, raw),
        None => Ok(default),
    }
}

fn parse_duration(field: &str, raw: String) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(raw.trim()).map_err(|source| ConfigLoadError::InvalidDuration {
        field: field.to_string(),
        value: raw,
        source,
    })
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigLoadError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().map_err(ConfigLoadError::CurrentDir)?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AvailabilityPolicy;

    const MINIMAL: &str = r#"
        [[bindings]]
        root = "/srv/inbox/pictures"
        processor = "pictures"

        [processors.pictures]
        kind = "discard"
    "#;

    #[test]
    fn defaults_fill_missing_sections() {
        let load = load_from_str(MINIMAL, Path::new("/etc/intake")).unwrap();
        let config = load.config;
        assert_eq!(config.tick_period, Duration::from_secs(5));
        assert_eq!(config.workers, WorkerConfig::default());
        assert_eq!(config.availability.policy, AvailabilityPolicy::Lsof);
        assert_eq!(config.availability.total_timeout, Duration::from_secs(360));
        assert!(config.status.is_none());
        assert_eq!(config.metadata.source, ConfigSource::Inline);
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn relative_paths_follow_the_config_directory() {
        let text = r#"
            scratch_dir = "scratch"

            [[bindings]]
            root = "inbox/music"
            processor = "music"

            [processors.music]
            kind = "archive"
            destination = "../library"
            extensions = [".FLAC", "mp3"]
            convert = [ { program = "ffmpeg", args = ["-i", "{input}", "{output}"], extension = ".mp3", destination = "/srv/mp3", timeout = "10m" } ]
        "#;
        let config = load_from_str(text, Path::new("/etc/intake")).unwrap().config;

        assert_eq!(config.scratch_dir, PathBuf::from("/etc/intake/scratch"));
        assert_eq!(config.bindings[0].root, PathBuf::from("/etc/intake/inbox/music"));
        let ProcessorConfig::Archive(archive) = config.processor("music").unwrap() else {
            panic!("expected archive processor");
        };
        assert_eq!(archive.destination, PathBuf::from("/etc/library"));
        assert_eq!(archive.extensions, vec!["flac".to_string(), "mp3".to_string()]);
        assert_eq!(archive.convert[0].extension, "mp3");
        assert_eq!(archive.convert[0].timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn bad_duration_names_the_field() {
        let text = format!("tick_period = \"soon\"\n{MINIMAL}");
        let err = load_from_str(&text, Path::new("/etc")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidDuration { ref field, .. } if field == "tick_period"));
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let text = format!("[status]\nbind = \"not-an-address\"\n{MINIMAL}");
        let err = load_from_str(&text, Path::new("/etc")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidBind { .. }));
    }

    #[test]
    fn unknown_processor_kind_is_a_parse_error() {
        let text = r#"
            [[bindings]]
            root = "/in"
            processor = "x"

            [processors.x]
            kind = "teleport"
        "#;
        let err = load_from_str(text, Path::new("/")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }
}
