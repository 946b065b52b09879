//! Transactional client for the uci hierarchical config store.
//!
//! Reads go through `uci export <file>`, whose canonical syntax is parsed
//! into an in-memory tree ([`UciFile`]). Mutations are buffered on a
//! [`UciTransaction`] and rendered into a single `uci batch` script on
//! commit, followed by one `commit <file>` per touched file; dropping the
//! transaction without committing discards everything.
//!
//! Callers mutating the store must hold the [`crate::locks::LOCK_UCI`]
//! write lock; reads take the read lock. The client itself does not
//! acquire locks — the dispatch middleware owns that (see the daemon's
//! registry).
//!
//! Bool options are stored as the strings `"0"` / `"1"`; [`parse_bool`]
//! and [`store_bool`] are the only conversion paths.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::exec::{self, ExecError};

/// Default uci binary path.
const UCI_BIN: &str = "/sbin/uci";

/// One option value: a scalar or an option-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UciValue {
    Single(String),
    List(Vec<String>),
}

impl UciValue {
    /// Scalar view of the value; the first element for lists.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Single(value) => Some(value),
            Self::List(items) => items.first().map(String::as_str),
        }
    }
}

/// One `config` section of a uci file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UciSection {
    pub section_type: String,
    /// `None` for anonymous sections.
    pub name: Option<String>,
    /// Options in file order.
    pub options: Vec<(String, UciValue)>,
}

impl UciSection {
    /// Look an option up by name.
    #[must_use]
    pub fn option(&self, option: &str) -> Option<&UciValue> {
        self.options
            .iter()
            .find(|(name, _)| name == option)
            .map(|(_, value)| value)
    }
}

/// Parsed tree of one uci file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UciFile {
    pub package: String,
    pub sections: Vec<UciSection>,
}

impl UciFile {
    /// All sections of the given type, in file order.
    #[must_use]
    pub fn sections_by_type(&self, section_type: &str) -> Vec<&UciSection> {
        self.sections
            .iter()
            .filter(|section| section.section_type == section_type)
            .collect()
    }

    /// The named section, if present.
    #[must_use]
    pub fn section_named(&self, name: &str) -> Option<&UciSection> {
        self.sections
            .iter()
            .find(|section| section.name.as_deref() == Some(name))
    }

    /// Scalar option of a named section; `RecordNotFound` when absent.
    pub fn option_named(&self, section: &str, option: &str) -> Result<&str, UciError> {
        self.section_named(section)
            .and_then(|s| s.option(option))
            .and_then(UciValue::as_scalar)
            .ok_or_else(|| UciError::RecordNotFound {
                path: format!("{}.{section}.{option}", self.package),
            })
    }

    /// Scalar option of a named section, with a default for absent paths.
    #[must_use]
    pub fn option_named_or<'a>(&'a self, section: &str, option: &str, default: &'a str) -> &'a str {
        self.option_named(section, option).unwrap_or(default)
    }

    /// Scalar option of the `index`-th anonymous section of a type.
    pub fn option_anonymous(
        &self,
        section_type: &str,
        index: usize,
        option: &str,
    ) -> Result<&str, UciError> {
        self.sections_by_type(section_type)
            .get(index)
            .and_then(|s| s.option(option))
            .and_then(UciValue::as_scalar)
            .ok_or_else(|| UciError::RecordNotFound {
                path: format!("{}.@{section_type}[{index}].{option}", self.package),
            })
    }

    /// Like [`Self::option_anonymous`], with a default for absent paths.
    #[must_use]
    pub fn option_anonymous_or<'a>(
        &'a self,
        section_type: &str,
        index: usize,
        option: &str,
        default: &'a str,
    ) -> &'a str {
        self.option_anonymous(section_type, index, option)
            .unwrap_or(default)
    }
}

/// Config-store failures.
#[derive(Debug, Error)]
pub enum UciError {
    /// Requested option or section does not exist and no default was
    /// supplied. Handlers usually catch this and substitute defaults.
    #[error("uci record not found: {path}")]
    RecordNotFound { path: String },
    #[error("uci command failed with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },
    #[error("failed to parse uci export output at line: {line}")]
    Parse { line: String },
    #[error("'{value}' is not a uci bool (expected \"0\" or \"1\")")]
    InvalidBool { value: String },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Parse a uci bool string. `"0"` and `"1"` are the only encodings.
pub fn parse_bool(value: &str) -> Result<bool, UciError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(UciError::InvalidBool {
            value: other.to_string(),
        }),
    }
}

/// Encode a bool the way the store expects it.
#[must_use]
pub const fn store_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Client for the external uci tool.
#[derive(Debug, Clone, Default)]
pub struct UciClient {
    /// Alternative config directory (`uci -c`), used by tests.
    config_dir: Option<PathBuf>,
}

impl UciClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the tool at an alternative config directory.
    #[must_use]
    pub fn with_config_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(dir.into()),
        }
    }

    fn base_args(&self) -> Vec<String> {
        match &self.config_dir {
            Some(dir) => vec!["-c".to_string(), dir.display().to_string()],
            None => Vec::new(),
        }
    }

    /// Read the current tree of one file.
    pub async fn read(&self, file: &str) -> Result<UciFile, UciError> {
        let mut args = self.base_args();
        args.push("export".to_string());
        args.push(file.to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = exec::run(Path::new(UCI_BIN), &arg_refs, None).await?;
        if !output.success() {
            return Err(UciError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        parse_export(file, &output.stdout)
    }

    /// Open a buffered transaction.
    #[must_use]
    pub fn transaction(&self) -> UciTransaction {
        UciTransaction {
            client: self.clone(),
            commands: Vec::new(),
            touched: BTreeSet::new(),
        }
    }
}

/// Buffered mutations; committed atomically from the caller's view.
pub struct UciTransaction {
    client: UciClient,
    commands: Vec<String>,
    touched: BTreeSet<String>,
}

impl UciTransaction {
    pub fn set_option(&mut self, file: &str, section: &str, option: &str, value: &str) -> &mut Self {
        self.push(file, format!("set {file}.{section}.{option}={}", quote(value)))
    }

    pub fn del_option(&mut self, file: &str, section: &str, option: &str) -> &mut Self {
        self.push(file, format!("delete {file}.{section}.{option}"))
    }

    /// Create a section. Named when `name` is given, anonymous otherwise.
    pub fn add_section(&mut self, file: &str, section_type: &str, name: Option<&str>) -> &mut Self {
        match name {
            Some(name) => self.push(file, format!("set {file}.{name}={section_type}")),
            None => self.push(file, format!("add {file} {section_type}")),
        }
    }

    pub fn del_section(&mut self, file: &str, section: &str) -> &mut Self {
        self.push(file, format!("delete {file}.{section}"))
    }

    pub fn add_to_list(&mut self, file: &str, section: &str, option: &str, value: &str) -> &mut Self {
        self.push(
            file,
            format!("add_list {file}.{section}.{option}={}", quote(value)),
        )
    }

    pub fn del_from_list(&mut self, file: &str, section: &str, option: &str, value: &str) -> &mut Self {
        self.push(
            file,
            format!("del_list {file}.{section}.{option}={}", quote(value)),
        )
    }

    /// Replace a whole option-list with new items.
    pub fn replace_list(
        &mut self,
        file: &str,
        section: &str,
        option: &str,
        values: &[String],
    ) -> &mut Self {
        self.push(file, format!("delete {file}.{section}.{option}"));
        for value in values {
            self.push(
                file,
                format!("add_list {file}.{section}.{option}={}", quote(value)),
            );
        }
        self
    }

    fn push(&mut self, file: &str, command: String) -> &mut Self {
        self.touched.insert(file.to_string());
        self.commands.push(command);
        self
    }

    /// Render the batch script that `commit` would feed to the tool.
    #[must_use]
    pub fn render_batch(&self) -> String {
        let mut script = String::new();
        for command in &self.commands {
            let _ = writeln!(script, "{command}");
        }
        for file in &self.touched {
            let _ = writeln!(script, "commit {file}");
        }
        script
    }

    /// Commit all buffered changes. The tool's `commit` runs once per
    /// touched file; on any failure nothing further is attempted and the
    /// store keeps its previous committed state.
    pub async fn commit(self) -> Result<(), UciError> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let script = self.render_batch();
        debug!(files = ?self.touched, "committing uci transaction");
        let mut args = self.client.base_args();
        args.push("batch".to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = exec::run(Path::new(UCI_BIN), &arg_refs, Some(&script)).await?;
        if !output.success() {
            return Err(UciError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}

/// Quote a value for the batch script; single quotes, shell-style escape.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Parse `uci export` output for one file.
fn parse_export(file: &str, output: &str) -> Result<UciFile, UciError> {
    let mut tree = UciFile {
        package: file.to_string(),
        sections: Vec::new(),
    };
    for raw_line in output.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "package" => {
                tree.package = unquote(rest.trim()).to_string();
            }
            "config" => {
                let rest = rest.trim();
                let (section_type, name) = match rest.split_once(' ') {
                    Some((section_type, name)) => {
                        (section_type, Some(unquote(name.trim()).to_string()))
                    }
                    None => (rest, None),
                };
                if section_type.is_empty() {
                    return Err(UciError::Parse {
                        line: raw_line.to_string(),
                    });
                }
                tree.sections.push(UciSection {
                    section_type: section_type.to_string(),
                    name,
                    options: Vec::new(),
                });
            }
            "option" | "list" => {
                let rest = rest.trim();
                let (option, value) = rest.split_once(' ').ok_or_else(|| UciError::Parse {
                    line: raw_line.to_string(),
                })?;
                let value = unquote(value.trim()).to_string();
                let section = tree.sections.last_mut().ok_or_else(|| UciError::Parse {
                    line: raw_line.to_string(),
                })?;
                if keyword == "option" {
                    section
                        .options
                        .push((option.to_string(), UciValue::Single(value)));
                } else {
                    match section.options.iter_mut().find(|(name, _)| name == option) {
                        Some((_, UciValue::List(items))) => items.push(value),
                        Some(_) | None => section
                            .options
                            .push((option.to_string(), UciValue::List(vec![value]))),
                    }
                }
            }
            _ => {
                return Err(UciError::Parse {
                    line: raw_line.to_string(),
                });
            }
        }
    }
    Ok(tree)
}

/// Strip uci export quoting (`'…'` with `'\''` escapes).
fn unquote(value: &str) -> String {
    let inner = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value);
    inner.replace("'\\''", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "package fosquitto\n\n\
config global 'global'\n\
\toption enabled '1'\n\n\
config subordinate '1122334455667788'\n\
\toption enabled '1'\n\
\toption address '10.0.0.2'\n\
\toption port '11884'\n\
\tlist dhcp_names 'one'\n\
\tlist dhcp_names 'two'\n\n\
config listener\n\
\toption port '11883'\n";

    #[test]
    fn parses_named_anonymous_and_lists() {
        let tree = parse_export("fosquitto", EXPORT).unwrap();
        assert_eq!(tree.package, "fosquitto");
        assert_eq!(tree.sections.len(), 3);

        let sub = tree.section_named("1122334455667788").unwrap();
        assert_eq!(sub.section_type, "subordinate");
        assert_eq!(
            sub.option("dhcp_names"),
            Some(&UciValue::List(vec!["one".into(), "two".into()]))
        );

        let listeners = tree.sections_by_type("listener");
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].name, None);
    }

    #[test]
    fn option_lookups_and_defaults() {
        let tree = parse_export("fosquitto", EXPORT).unwrap();
        assert_eq!(tree.option_named("global", "enabled").unwrap(), "1");
        assert_eq!(tree.option_named_or("global", "missing", "x"), "x");
        assert_eq!(tree.option_anonymous("listener", 0, "port").unwrap(), "11883");
        assert!(matches!(
            tree.option_named("global", "missing"),
            Err(UciError::RecordNotFound { .. })
        ));
        assert!(matches!(
            tree.option_anonymous("listener", 3, "port"),
            Err(UciError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn bool_encoding_is_strict() {
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(matches!(
            parse_bool("true"),
            Err(UciError::InvalidBool { .. })
        ));
        assert_eq!(store_bool(true), "1");
        assert_eq!(store_bool(false), "0");
    }

    #[test]
    fn transaction_renders_batch_with_single_commit_per_file() {
        let client = UciClient::new();
        let mut tx = client.transaction();
        tx.add_section("fosquitto", "subordinate", Some("aabbccddeeff0011"))
            .set_option("fosquitto", "aabbccddeeff0011", "enabled", "1")
            .add_to_list("fosquitto", "aabbccddeeff0011", "dhcp_names", "it's")
            .set_option("resolver", "common", "forward_upstream", "0");
        let script = tx.render_batch();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines,
            vec![
                "set fosquitto.aabbccddeeff0011=subordinate",
                "set fosquitto.aabbccddeeff0011.enabled='1'",
                "add_list fosquitto.aabbccddeeff0011.dhcp_names='it'\\''s'",
                "set resolver.common.forward_upstream='0'",
                "commit fosquitto",
                "commit resolver",
            ]
        );
    }

    #[test]
    fn replace_list_deletes_then_adds() {
        let client = UciClient::new();
        let mut tx = client.transaction();
        tx.replace_list(
            "network",
            "lan",
            "dns",
            &["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        );
        let script = tx.render_batch();
        assert!(script.starts_with("delete network.lan.dns\n"));
        assert_eq!(script.matches("add_list").count(), 2);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_export("x", "garbage line here").is_err());
        assert!(parse_export("x", "option orphan 'v'").is_err());
    }
}
