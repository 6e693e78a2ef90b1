use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use intake_config::{ArchiveConfig, ConvertStep};
use intake_core::{
    CommandSpec, FileProcessor, ProcessRequest, ProcessRunner, ProcessorError, begin_move,
};
use tracing::{debug, info, warn};

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Moves each file into a library tree that mirrors the watched root and
/// optionally renders converted copies next to it.
///
/// The move is journaled with a recovery marker. If any conversion fails the
/// move is rolled back, so a failed file is still at its original path.
pub struct ArchiveProcessor {
    config: ArchiveConfig,
    runner: Arc<dyn ProcessRunner>,
}

impl std::fmt::Debug for ArchiveProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ArchiveProcessor {
    pub fn new(config: ArchiveConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    /// Whether `relative` passes the extension allow-list.
    pub fn accepts(&self, relative: &Path) -> bool {
        if self.config.extensions.is_empty() {
            return true;
        }
        relative
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| self.config.extensions.contains(&ext))
    }

    async fn convert_all(
        &self,
        request: &ProcessRequest,
        relative: &Path,
        written: &mut Vec<PathBuf>,
    ) -> Result<(), ProcessorError> {
        for step in &self.config.convert {
            let output = step.destination.join(relative).with_extension(&step.extension);
            if let Some(parent) = output.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let spec = command_for(step, &request.staged, &output);
            debug!(target: "intake::capability", command = %spec, "converting");
            written.push(output);

            let result = self.runner.run(&spec).await?;
            if !result.success() {
                return Err(ProcessorError::CommandFailed {
                    command: spec.to_string(),
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileProcessor for ArchiveProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<(), ProcessorError> {
        let relative = request.relative_path();
        if !self.accepts(relative) {
            info!(
                target: "intake::capability",
                path = %request.source.display(),
                "extension not archived; skipping"
            );
            return Ok(());
        }

        let destination = self.config.destination.join(relative);
        let pending = begin_move(&request.source, &destination).await?;

        let mut written = Vec::new();
        match self.convert_all(request, relative, &mut written).await {
            Ok(()) => {
                pending.commit().await?;
                info!(
                    target: "intake::capability",
                    path = %request.source.display(),
                    destination = %destination.display(),
                    converted = written.len(),
                    "archived"
                );
                Ok(())
            }
            Err(err) => {
                remove_partial_outputs(&written).await;
                if let Err(rollback) = pending.rollback().await {
                    warn!(
                        target: "intake::capability",
                        path = %request.source.display(),
                        error = %rollback,
                        "could not undo archive move; the marker is left for startup recovery"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Delete outputs of an aborted conversion run. Returns how many could not
/// be removed.
async fn remove_partial_outputs(written: &[PathBuf]) -> usize {
    let mut left = 0;
    for partial in written {
        match tokio::fs::remove_file(partial).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target: "intake::capability",
                    output = %partial.display(),
                    error = %err,
                    "CleanupFailure: could not remove partial output"
                );
                left += 1;
            }
        }
    }
    left
}

fn command_for(step: &ConvertStep, input: &Path, output: &Path) -> CommandSpec {
    let input = input.to_string_lossy();
    let output = output.to_string_lossy();
    let args = step.args.iter().map(|arg| {
        arg.replace(INPUT_PLACEHOLDER, &input)
            .replace(OUTPUT_PLACEHOLDER, &output)
    });
    let spec = CommandSpec::new(step.program.clone()).args(args);
    match step.timeout {
        Some(timeout) => spec.timeout(timeout),
        None => spec,
    }
}
