//! Document filter plugins deciding which revisions end up in a dump.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter program not found: {0}")]
    NotFound(String),
    #[error("failed to run filter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("filter {program} exited with unexpected status {status}")]
    UnexpectedStatus { program: String, status: String },
    #[error("failed to encode filter input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Predicate over one fetched revision.
///
/// `latest_rev` is the newest revision of the document, so older revisions
/// can be judged against the current state of their chain.
#[async_trait]
pub trait DocumentFilter: Send + Sync {
    async fn keep(&self, doc: &Value, latest_rev: &str) -> Result<bool, FilterError>;
}

/// Filter backed by an in-process closure.
pub struct FnFilter<F>(pub F);

#[async_trait]
impl<F> DocumentFilter for FnFilter<F>
where
    F: Fn(&Value, &str) -> bool + Send + Sync,
{
    async fn keep(&self, doc: &Value, latest_rev: &str) -> Result<bool, FilterError> {
        Ok((self.0)(doc, latest_rev))
    }
}

/// Filter backed by an external program.
///
/// Each call spawns the program, writes `{"doc": ..., "latest_rev": "..."}`
/// to its stdin and reads the verdict from the exit status: 0 keeps the
/// revision, 1 skips it, anything else is an error.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandFilter {
    /// Resolves `program` once, either as a path or through `PATH`.
    pub fn resolve(program: &str, args: Vec<String>) -> Result<Self, FilterError> {
        let candidate = Path::new(program);
        let resolved = if candidate.components().count() > 1 {
            candidate.is_file().then(|| candidate.to_path_buf())
        } else {
            std::env::var_os("PATH").and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(program))
                    .find(|path| path.is_file())
            })
        };

        match resolved {
            Some(program) => Ok(Self { program, args }),
            None => Err(FilterError::NotFound(program.to_string())),
        }
    }

    /// Builds a filter from a `[program, args...]` command line.
    pub fn from_command_line(command: &[String]) -> Result<Self, FilterError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| FilterError::NotFound(String::new()))?;
        Self::resolve(program, args.to_vec())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl DocumentFilter for CommandFilter {
    async fn keep(&self, doc: &Value, latest_rev: &str) -> Result<bool, FilterError> {
        let program = self.program.display().to_string();
        let input = serde_json::to_vec(&json!({ "doc": doc, "latest_rev": latest_rev }))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FilterError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A filter may decide without reading its whole input.
            if let Err(source) = stdin.write_all(&input).await {
                if source.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(FilterError::Spawn { program, source });
                }
            }
        }

        let status = child.wait().await.map_err(|source| FilterError::Spawn {
            program: program.clone(),
            source,
        })?;

        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(FilterError::UnexpectedStatus {
                program,
                status: status.to_string(),
            }),
        }
    }
}
