//! Strategies backed by an external executable.
//!
//! The executable is handed a directory of symlinks to one batch of
//! datapoints at a time and rewrites them in place. Which executable to run
//! is an operational setting (`opt.bin`) and never part of the recorded
//! parameters; the argument list is.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dataset::store::link_file;
use crate::dataset::{Datapoint, Dataset};
use crate::error::StageError;

use super::{Anonymizer, Deanonymizer, ParamSet, StageContext};

/// Placeholder replaced by the batch directory.
pub const BATCH_PLACEHOLDER: &str = "{batch}";

/// A program and its argument template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Arguments with every `{name}` placeholder replaced.
    pub fn render(&self, substitutions: &[(&str, &Path)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                substitutions.iter().fold(arg.clone(), |acc, (name, path)| {
                    acc.replace(&format!("{{{}}}", name), &path.to_string_lossy())
                })
            })
            .collect()
    }

    fn display(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the command to completion and returns its standard output.
    ///
    /// # Errors
    /// `ExternalProcess` when the program cannot be started or exits with a
    /// non-zero status.
    pub async fn run(&self, substitutions: &[(&str, &Path)]) -> Result<String, StageError> {
        let args = self.render(substitutions);
        let shown = self.display(&args);
        debug!(command = %shown, "Running external command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StageError::ExternalProcess {
                command: shown.clone(),
                code: None,
                output: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stdout.trim().is_empty() {
            debug!(command = %shown, "{}", stdout.trim_end());
        }
        if !output.status.success() {
            return Err(StageError::ExternalProcess {
                command: shown,
                code: output.status.code(),
                output: if stderr.trim().is_empty() { stdout } else { stderr },
            });
        }
        Ok(stdout)
    }
}

/// Links `points` into a fresh batch directory under `folder`.
fn stage_batch(folder: &Path, index: usize, points: &[Datapoint]) -> Result<PathBuf, StageError> {
    let batch_dir = folder.join(format!(".batch-{}", index));
    if batch_dir.exists() {
        fs::remove_dir_all(&batch_dir)?;
    }
    fs::create_dir(&batch_dir)?;
    for point in points {
        let target = fs::canonicalize(point.path())?;
        link_file(&target, &batch_dir.join(file_name(point.path())))?;
    }
    Ok(batch_dir)
}

/// Moves files the tool replaced (rather than wrote through) back into place.
fn collect_batch(batch_dir: &Path, points: &[Datapoint]) -> Result<(), StageError> {
    for point in points {
        let staged = batch_dir.join(file_name(point.path()));
        match fs::symlink_metadata(&staged) {
            Ok(meta) if !meta.file_type().is_symlink() => {
                fs::rename(&staged, point.path())?;
            }
            Ok(_) => {}
            Err(_) => {
                return Err(StageError::Failed {
                    stage: "external".to_string(),
                    message: format!("tool removed '{}'", staged.display()),
                });
            }
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Runs `command` over `dataset` in batches of `batch_size`.
async fn run_batches(
    command: &ExternalCommand,
    dataset: &Dataset,
    batch_size: usize,
) -> Result<(), StageError> {
    let points: Vec<Datapoint> = dataset.datapoints().values().cloned().collect();
    let batch_size = batch_size.max(1);
    if batch_size == 1 && points.len() > 1 {
        warn!(dataset = dataset.name(), "Running external tool with batches of a single datapoint");
    }

    for (index, batch) in points.chunks(batch_size).enumerate() {
        info!(
            dataset = dataset.name(),
            batch = index,
            datapoints = batch.len(),
            "Processing batch"
        );
        let batch_dir = stage_batch(dataset.folder(), index, batch)?;
        let outcome = async {
            let args_use_placeholder = command.args.iter().any(|a| a.contains(BATCH_PLACEHOLDER));
            if args_use_placeholder {
                command.run(&[("batch", batch_dir.as_path())]).await?;
            } else {
                let mut appended = command.clone();
                appended.args.push(batch_dir.to_string_lossy().into_owned());
                appended.run(&[]).await?;
            }
            collect_batch(&batch_dir, batch)
        }
        .await;
        if let Err(e) = fs::remove_dir_all(&batch_dir) {
            warn!(path = %batch_dir.display(), error = %e, "Failed to remove batch directory");
        }
        outcome?;
    }
    Ok(())
}

/// Reads `opt.bin` and `opt.batch_size`.
fn operational_command(
    params: &ParamSet,
    args: Vec<String>,
) -> Result<(ExternalCommand, Option<usize>), StageError> {
    let opt = params.operational();
    let program = match opt.get("bin") {
        Some(Value::String(bin)) => bin.clone(),
        _ => {
            return Err(StageError::MissingParameter {
                stage: params.stage().to_string(),
                param: "opt.bin".to_string(),
            })
        }
    };
    let batch_size = match opt.get("batch_size") {
        None => None,
        Some(v) => Some(v.as_u64().filter(|n| *n > 0).ok_or_else(|| {
            StageError::InvalidParameter {
                stage: params.stage().to_string(),
                param: "opt.batch_size".to_string(),
                message: "expected a positive integer".to_string(),
            }
        })? as usize),
    };
    Ok((ExternalCommand::new(program, args), batch_size))
}

/// `external` anonymizer.
///
/// Parameters: `args` (argument template, `{batch}` marks the batch
/// directory, otherwise it is appended), `opt.bin` (required) and
/// `opt.batch_size`.
#[derive(Debug, Clone)]
pub struct ExternalAnonymizer {
    params: Mapping,
    command: ExternalCommand,
    batch_size: Option<usize>,
}

impl ExternalAnonymizer {
    pub const NAME: &'static str = "external";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("anonymization external", raw);
        let args = params.string_list("args")?;
        let (command, batch_size) = operational_command(&params, args)?;
        Ok(Self {
            params: params.into_mapping(),
            command,
            batch_size,
        })
    }

    pub fn command(&self) -> &ExternalCommand {
        &self.command
    }
}

#[async_trait]
impl Anonymizer for ExternalAnonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    async fn anonymize(
        &self,
        ctx: &StageContext,
        dataset: &Dataset,
        _background: Option<&Dataset>,
    ) -> Result<(), StageError> {
        run_batches(&self.command, dataset, self.batch_size.unwrap_or(ctx.batch_size)).await
    }
}

/// `external` de-anonymizer.
///
/// Same parameters as [`ExternalAnonymizer`] plus an optional
/// `train_args` template run once with `{clear}` and `{anon}` replaced by
/// the attacker's dataset folders.
#[derive(Debug, Clone)]
pub struct ExternalDeanonymizer {
    params: Mapping,
    command: ExternalCommand,
    train: Option<ExternalCommand>,
    batch_size: Option<usize>,
}

impl ExternalDeanonymizer {
    pub const NAME: &'static str = "external";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("deanonymization external", raw);
        let args = params.string_list("args")?;
        let train_args = params.string_list("train_args")?;
        let (command, batch_size) = operational_command(&params, args)?;
        let train = (!train_args.is_empty())
            .then(|| ExternalCommand::new(command.program.clone(), train_args));
        Ok(Self {
            params: params.into_mapping(),
            command,
            train,
            batch_size,
        })
    }
}

#[async_trait]
impl Deanonymizer for ExternalDeanonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    async fn train(
        &mut self,
        _ctx: &StageContext,
        clear: &Dataset,
        anonymized: &Dataset,
    ) -> Result<(), StageError> {
        let Some(train) = &self.train else {
            return Ok(());
        };
        info!(clear = clear.name(), anon = anonymized.name(), "Training external de-anonymizer");
        train
            .run(&[("clear", clear.folder()), ("anon", anonymized.folder())])
            .await
            .map(|_| ())
    }

    async fn deanonymize(&self, ctx: &StageContext, dataset: &Dataset) -> Result<(), StageError> {
        run_batches(&self.command, dataset, self.batch_size.unwrap_or(ctx.batch_size)).await
    }
}
