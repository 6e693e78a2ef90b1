use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use intake_core::BindingError;
use intake_core::processor::check_disjoint_roots;
use thiserror::Error;

use crate::models::{AvailabilityPolicy, Config, ProcessorConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("no [[bindings]] configured; nothing would be watched")]
    NoBindings,
    #[error("binding for {root} refers to unknown processor '{processor}'")]
    UnknownProcessor { root: PathBuf, processor: String },
    #[error(transparent)]
    Roots(#[from] BindingError),
    #[error("invalid worker configuration: {reason}")]
    InvalidWorkers { reason: String },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("convert step for processor '{processor}' has an empty {field}")]
    IncompleteConvertStep {
        processor: String,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.bindings.is_empty() {
        return Err(ConfigGuardRailError::NoBindings);
    }

    for binding in &config.bindings {
        if !config.processors.contains_key(&binding.processor) {
            return Err(ConfigGuardRailError::UnknownProcessor {
                root: binding.root.clone(),
                processor: binding.processor.clone(),
            });
        }
    }

    check_disjoint_roots(config.roots())?;

    let workers = &config.workers;
    if workers.core == 0 {
        return Err(ConfigGuardRailError::InvalidWorkers {
            reason: "workers.core must be at least 1".into(),
        });
    }
    if workers.core > workers.max {
        return Err(ConfigGuardRailError::InvalidWorkers {
            reason: format!(
                "workers.core ({}) exceeds workers.max ({})",
                workers.core, workers.max
            ),
        });
    }
    if workers.queue_capacity == 0 {
        return Err(ConfigGuardRailError::InvalidWorkers {
            reason: "workers.queue_capacity must be at least 1".into(),
        });
    }

    require_positive(config.tick_period, "tick_period")?;
    require_positive(config.availability.retry_interval, "availability.retry_interval")?;
    require_positive(config.availability.total_timeout, "availability.total_timeout")?;

    for (id, processor) in &config.processors {
        if let ProcessorConfig::Archive(archive) = processor {
            for step in &archive.convert {
                if step.program.trim().is_empty() {
                    return Err(ConfigGuardRailError::IncompleteConvertStep {
                        processor: id.clone(),
                        field: "program",
                    });
                }
                if step.extension.trim().is_empty() {
                    return Err(ConfigGuardRailError::IncompleteConvertStep {
                        processor: id.clone(),
                        field: "extension",
                    });
                }
            }
            if let Some(root) = config.roots().find(|root| archive.destination.starts_with(root)) {
                warnings.push_with_hint(
                    format!(
                        "archive destination {} of processor '{id}' lies inside watched root {}",
                        archive.destination.display(),
                        root.display()
                    ),
                    "Archived files would be picked up again; move the destination outside every root",
                );
            }
        }
    }

    if let Some(root) = config.roots().find(|root| config.scratch_dir.starts_with(root)) {
        warnings.push_with_hint(
            format!(
                "scratch directory {} lies inside watched root {}",
                config.scratch_dir.display(),
                root.display()
            ),
            "Staged copies would be discovered as new files; point scratch_dir elsewhere",
        );
    }

    let bound: BTreeSet<&str> = config
        .bindings
        .iter()
        .map(|binding| binding.processor.as_str())
        .collect();
    for id in config.processors.keys() {
        if !bound.contains(id.as_str()) {
            warnings.push(format!("processor '{id}' is defined but not bound to any root"));
        }
    }

    if config.availability.policy == AvailabilityPolicy::ExclusiveLock
        && config.availability.retry_interval > config.availability.total_timeout
    {
        warnings.push(
            "availability.retry_interval exceeds total_timeout; each check makes a single attempt",
        );
    }

    Ok(warnings)
}

fn require_positive(value: Duration, field: &'static str) -> Result<(), ConfigGuardRailError> {
    if value.is_zero() {
        return Err(ConfigGuardRailError::ZeroDuration { field });
    }
    Ok(())
}
