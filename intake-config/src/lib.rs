//! Configuration library for the Intake daemon.
//!
//! Resolves the configuration file (explicit path, `$INTAKE_CONFIG`, or a
//! default location), loads an optional `.env`, turns the raw file layout in
//! [`sources`] into the resolved [`models::Config`], and runs the guard rails
//! in [`validation`] before anything starts watching.

#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{
    CONFIG_PATH_ENV, ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions,
    load_from_str,
};
pub use models::{
    ArchiveConfig, AvailabilityConfig, AvailabilityPolicy, BindingConfig, Config, ConfigMetadata,
    ConfigSource, ConvertStep, ProcessorConfig, StatusConfig, WorkerConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
