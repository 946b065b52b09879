//! Init-script runner.
//!
//! Invokes `/etc/init.d/<script> <verb>` as a blocking external call and
//! applies the caller's failure policy: with [`FailPolicy::Raise`] a
//! non-zero exit becomes [`ServiceError::CmdFailed`]; with
//! [`FailPolicy::Log`] it is logged and swallowed. Invocations serialize
//! on the per-script named lock so script state transitions never race.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::exec::{self, CommandOutput, ExecError};
use crate::locks::{service_lock_name, LockError, LockRegistry};

/// Directory the init scripts live in.
const INIT_DIR: &str = "/etc/init.d";

/// Verbs an init script accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
}

impl Verb {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// What to do when the script exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPolicy {
    /// Raise [`ServiceError::CmdFailed`].
    Raise,
    /// Log at `warn` and return the output anyway.
    Log,
}

/// Service invocation failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{script}' {verb} failed with code {exit_code}: {stderr}")]
    CmdFailed {
        script: String,
        verb: &'static str,
        exit_code: i32,
        stderr: String,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Runner for init-script verbs.
#[derive(Clone)]
pub struct ServiceRunner {
    locks: Arc<LockRegistry>,
}

impl ServiceRunner {
    #[must_use]
    pub fn new(locks: Arc<LockRegistry>) -> Self {
        Self { locks }
    }

    /// Invoke `script` with `verb` under the script's named lock.
    pub async fn run(
        &self,
        script: &str,
        verb: Verb,
        policy: FailPolicy,
    ) -> Result<CommandOutput, ServiceError> {
        let _guard = self.locks.write(&service_lock_name(script)).await?;
        let path = PathBuf::from(INIT_DIR).join(script);
        debug!(script, verb = verb.as_str(), "invoking init script");
        let output = exec::run(&path, &[verb.as_str()], None).await?;
        if !output.success() {
            match policy {
                FailPolicy::Raise => {
                    return Err(ServiceError::CmdFailed {
                        script: script.to_string(),
                        verb: verb.as_str(),
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    });
                }
                FailPolicy::Log => {
                    warn!(
                        script,
                        verb = verb.as_str(),
                        exit_code = output.exit_code,
                        "init script failed; continuing per policy"
                    );
                }
            }
        }
        Ok(output)
    }
}
