//! External command invocation.
//!
//! Thin wrapper over [`tokio::process::Command`] used by the config-store
//! client and the service runner. Commands run with piped stdio, an
//! optional stdin payload, and honour [`crate::env::CMDLINE_ROOT_ENV`]
//! when the program is addressed by absolute path.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::env;

/// Captured result of one finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the child exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command invocation failures.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while talking to '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve `program` against the command-line sandbox root, if any.
#[must_use]
pub fn resolve_program(program: &Path) -> PathBuf {
    match env::cmdline_root() {
        Some(root) if program.is_absolute() => env::reroot(&root, program),
        _ => program.to_path_buf(),
    }
}

/// Run `program` with `args`, optionally feeding `stdin`, and wait for it.
///
/// The child's stdout and stderr are captured whole; callers that need
/// line-by-line streaming use the async command runtime instead.
pub async fn run(
    program: &Path,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<CommandOutput, ExecError> {
    let resolved = resolve_program(program);
    let program_display = resolved.display().to_string();
    debug!(program = %program_display, ?args, "running external command");

    let mut command = Command::new(&resolved);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program_display.clone(),
        source,
    })?;

    if let Some(payload) = stdin {
        // Take stdin out of the child so the pipe closes once written;
        // uci batch reads until EOF.
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(payload.as_bytes())
                .await
                .map_err(|source| ExecError::Io {
                    program: program_display.clone(),
                    source,
                })?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ExecError::Io {
            program: program_display.clone(),
            source,
        })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run(Path::new("sh"), &["-c", "echo hello; exit 3"], None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn feeds_stdin_payload() {
        let out = run(Path::new("cat"), &[], Some("piped input"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "piped input");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = run(Path::new("definitely-not-a-command-xyz"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
