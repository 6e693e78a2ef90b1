//! Processing capabilities named by `[processors.*]` and the wiring that
//! turns a loaded configuration into the core's runtime inputs.

pub mod archive;
pub mod discard;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use intake_config::{AvailabilityConfig, AvailabilityPolicy, Config, ProcessorConfig};
use intake_core::{
    AvailabilityChecker, ExclusiveLock, FileProcessor, LsofProbe, PoolConfig, ProcessRunner,
    ProcessorBinding, ProcessorTable, RuntimeConfig,
};

pub use archive::ArchiveProcessor;
pub use discard::DiscardProcessor;

pub fn build_processor(
    config: &ProcessorConfig,
    runner: Arc<dyn ProcessRunner>,
) -> Arc<dyn FileProcessor> {
    match config {
        ProcessorConfig::Discard => Arc::new(DiscardProcessor),
        ProcessorConfig::Archive(archive) => Arc::new(ArchiveProcessor::new(archive.clone(), runner)),
    }
}

/// Resolve every binding to its capability. Bindings sharing a processor id
/// share one instance.
pub fn build_table(
    config: &Config,
    runner: Arc<dyn ProcessRunner>,
) -> anyhow::Result<ProcessorTable> {
    let instances: BTreeMap<&str, Arc<dyn FileProcessor>> = config
        .processors
        .iter()
        .map(|(id, processor)| (id.as_str(), build_processor(processor, Arc::clone(&runner))))
        .collect();

    let bindings = config
        .bindings
        .iter()
        .map(|binding| {
            instances
                .get(binding.processor.as_str())
                .map(|processor| {
                    ProcessorBinding::new(
                        binding.root.clone(),
                        binding.processor.clone(),
                        Arc::clone(processor),
                    )
                })
                .ok_or_else(|| anyhow!("processor '{}' is not defined", binding.processor))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    ProcessorTable::new(bindings).context("invalid root bindings")
}

pub fn build_checker(
    config: &AvailabilityConfig,
    runner: Arc<dyn ProcessRunner>,
) -> Arc<dyn AvailabilityChecker> {
    match config.policy {
        AvailabilityPolicy::Lsof => Arc::new(
            LsofProbe::new(runner)
                .with_program(config.lsof_program.clone())
                .with_probe_timeout(config.retry_interval)
                .with_give_up_after(config.total_timeout),
        ),
        AvailabilityPolicy::ExclusiveLock => Arc::new(ExclusiveLock::new(
            config.retry_interval,
            config.total_timeout,
        )),
    }
}

pub fn runtime_config(config: &Config) -> RuntimeConfig {
    let mut runtime = RuntimeConfig::new(config.scratch_dir.clone());
    runtime.tick_period = config.tick_period;
    runtime.pool = PoolConfig {
        core_workers: config.workers.core,
        max_workers: config.workers.max,
        queue_capacity: config.workers.queue_capacity,
        idle_timeout: config.workers.idle_timeout,
    };
    runtime
}
