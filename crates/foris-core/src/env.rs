//! Environment overrides honoured across the control plane.
//!
//! All three variables exist for the test suite: they redirect absolute
//! filesystem paths, external command lookups and the updater backend
//! module into a sandbox without touching production defaults.

use std::path::{Path, PathBuf};

/// Redirects absolute file paths into a sandbox root.
pub const FILE_ROOT_ENV: &str = "FORIS_FILE_ROOT";

/// Redirects external command lookups into a sandbox root.
pub const CMDLINE_ROOT_ENV: &str = "FORIS_CMDLINE_ROOT";

/// Overrides the package-updater backend module name.
pub const UPDATER_MODULE_ENV: &str = "FC_UPDATER_MODULE";

/// Default name of the package-updater backend module.
pub const DEFAULT_UPDATER_MODULE: &str = "updater";

/// Sandbox root for absolute file paths, if configured.
#[must_use]
pub fn file_root() -> Option<PathBuf> {
    std::env::var_os(FILE_ROOT_ENV).map(PathBuf::from)
}

/// Sandbox root for external command lookups, if configured.
#[must_use]
pub fn cmdline_root() -> Option<PathBuf> {
    std::env::var_os(CMDLINE_ROOT_ENV).map(PathBuf::from)
}

/// Name of the updater backend module, honouring the override.
#[must_use]
pub fn updater_module_name() -> String {
    std::env::var(UPDATER_MODULE_ENV).unwrap_or_else(|_| DEFAULT_UPDATER_MODULE.to_string())
}

/// Re-root an absolute path under `root`.
///
/// Relative paths are returned unchanged; rerooting only applies to
/// absolute paths so sandboxed lookups compose with paths already built
/// against the sandbox.
#[must_use]
pub fn reroot(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reroot_moves_absolute_paths_under_root() {
        let rooted = reroot(Path::new("/tmp/sandbox"), Path::new("/etc/config/network"));
        assert_eq!(rooted, Path::new("/tmp/sandbox/etc/config/network"));
    }

    #[test]
    fn reroot_leaves_relative_paths_alone() {
        let rooted = reroot(Path::new("/tmp/sandbox"), Path::new("relative/file"));
        assert_eq!(rooted, Path::new("relative/file"));
    }
}
