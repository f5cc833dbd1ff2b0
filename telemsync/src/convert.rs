//! Runs the external `.ibt` to `.csv` converter.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to start converter {program:?}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("converter exited with {status} for {input:?}")]
    Failed { input: PathBuf, status: ExitStatus },
    #[error("converter reported success but {0:?} was not written")]
    MissingOutput(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Converter {
    exe: PathBuf,
    launcher: Vec<String>,
}

impl Converter {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            launcher: Vec::new(),
        }
    }

    /// Runs the converter through `launcher` (program first, then its
    /// arguments), e.g. `["wine"]`.
    pub fn with_launcher(mut self, launcher: Vec<String>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Invokes `<exe> --vars <vars> -o <output> <input>`; exit code 0 is success.
    pub async fn run(&self, input: &Path, output: &Path, vars: &Path) -> Result<(), ConvertError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.spawn_error(source))?;
        }
        let mut command = match self.launcher.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args).arg(&self.exe);
                command
            }
            None => Command::new(&self.exe),
        };
        command
            .arg("--vars")
            .arg(vars)
            .arg("-o")
            .arg(output)
            .arg(input)
            .kill_on_drop(true);

        debug!(input = %input.display(), output = %output.display(), "running converter");
        let status = command
            .status()
            .await
            .map_err(|source| self.spawn_error(source))?;
        if !status.success() {
            return Err(ConvertError::Failed {
                input: input.to_path_buf(),
                status,
            });
        }
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(ConvertError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }

    fn spawn_error(&self, source: io::Error) -> ConvertError {
        let program = self
            .launcher
            .first()
            .cloned()
            .unwrap_or_else(|| self.exe.display().to_string());
        ConvertError::Spawn { program, source }
    }
}
