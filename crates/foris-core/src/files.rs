//! Rooted file store.
//!
//! All absolute paths are re-rooted under `FORIS_FILE_ROOT` when that
//! variable is set, which is how the test suite redirects reads of
//! `/proc`, `/sys` and `/etc` into a sandbox. Writes are atomic: content
//! lands in a temporary file in the target directory and is renamed over
//! the destination after an explicit flush.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::env;

/// File store failures.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("content of '{path}' did not match the expected pattern")]
    FailedToParse { path: String },
}

/// Filesystem access with an optional sandbox root.
#[derive(Debug, Clone, Default)]
pub struct FileStore {
    root: Option<PathBuf>,
}

impl FileStore {
    /// Store honouring the `FORIS_FILE_ROOT` environment override.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: env::file_root(),
        }
    }

    /// Store with an explicit root, bypassing the environment.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Map a path through the sandbox root.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) => env::reroot(root, path),
            None => path.to_path_buf(),
        }
    }

    /// Whole-file read.
    pub fn read_to_string(&self, path: &Path) -> Result<String, FileError> {
        let resolved = self.resolve(path);
        fs::read_to_string(&resolved).map_err(|source| FileError::Io {
            path: resolved.display().to_string(),
            source,
        })
    }

    /// Read the file and extract the first capture group of `pattern`
    /// (the whole match when the pattern has no groups).
    pub fn extract(&self, path: &Path, pattern: &Regex) -> Result<String, FileError> {
        let content = self.read_to_string(path)?;
        let captures = pattern
            .captures(&content)
            .ok_or_else(|| FileError::FailedToParse {
                path: self.resolve(path).display().to_string(),
            })?;
        let matched = captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| FileError::FailedToParse {
                path: self.resolve(path).display().to_string(),
            })?;
        Ok(matched)
    }

    /// Whether the path exists inside the (possibly rooted) tree.
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    /// Atomic write: tempfile in the target directory, flush, rename.
    pub fn write_atomic(
        &self,
        path: &Path,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), FileError> {
        let resolved = self.resolve(path);
        let io_err = |source| FileError::Io {
            path: resolved.display().to_string(),
            source,
        };
        let parent = resolved.parent().unwrap_or_else(|| Path::new("/"));
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        temp.write_all(contents).map_err(io_err)?;
        temp.flush().map_err(io_err)?;
        if let Some(mode) = mode {
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode)).map_err(io_err)?;
        }
        temp.persist(&resolved).map_err(|e| FileError::Io {
            path: resolved.display().to_string(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Names in `dir` matching a `*`-glob pattern, sorted.
    pub fn list_glob(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, FileError> {
        let resolved = self.resolve(dir);
        let regex = glob_to_regex(pattern);
        let entries = fs::read_dir(&resolved).map_err(|source| FileError::Io {
            path: resolved.display().to_string(),
            source,
        })?;
        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| FileError::Io {
                path: resolved.display().to_string(),
                source,
            })?;
            let name = entry.file_name();
            if regex.is_match(&name.to_string_lossy()) {
                matches.push(entry.path());
            }
        }
        matches.sort();
        Ok(matches)
    }

    /// Recursive directory delete.
    pub fn remove_dir_all(&self, path: &Path) -> Result<(), FileError> {
        let resolved = self.resolve(path);
        fs::remove_dir_all(&resolved).map_err(|source| FileError::Io {
            path: resolved.display().to_string(),
            source,
        })
    }

    /// Set permission bits on an existing path.
    pub fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FileError> {
        let resolved = self.resolve(path);
        fs::set_permissions(&resolved, fs::Permissions::from_mode(mode)).map_err(|source| {
            FileError::Io {
                path: resolved.display().to_string(),
                source,
            }
        })
    }

    /// Best-effort recursive chown to a named user and their primary
    /// group. Resolution or chown failure is logged, never propagated.
    pub fn chown_best_effort(&self, path: &Path, user: &str) {
        let resolved = self.resolve(path);
        let Ok(Some(account)) = nix::unistd::User::from_name(user) else {
            warn!(user, "chown skipped: user not found");
            return;
        };
        let mut stack = vec![resolved];
        while let Some(current) = stack.pop() {
            if let Err(error) =
                nix::unistd::chown(&current, Some(account.uid), Some(account.gid))
            {
                warn!(path = %current.display(), %error, "chown failed");
            }
            if current.is_dir() {
                if let Ok(entries) = fs::read_dir(&current) {
                    stack.extend(entries.flatten().map(|e| e.path()));
                }
            }
        }
    }
}

/// Translate a `*`-only glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Regex {
    let mut expression = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expression.push_str(".*"),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    // The pattern is built from escaped literals and `.*` only.
    Regex::new(&expression).unwrap_or_else(|_| Regex::new("^$").unwrap())
}
