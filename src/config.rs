//! Configuration model and file loading.
//!
//! The raw layer is a permissive `serde_json::Value` tree as authored by the
//! user; the validator turns it into the strongly typed [`ResolvedConfig`]
//! consumed by the manager. This module also locates and parses config files
//! (YAML, JSON, or a `numux` key in `package.json`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

use crate::error::Error;

/// Config file names probed in the working directory, in order.
pub const CONFIG_CANDIDATES: [&str; 6] = [
    "numux.config.ts",
    "numux.config.js",
    "numux.yaml",
    "numux.yml",
    "numux.json",
    "package.json",
];

/// A fully validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Processes in declaration order.
    pub processes: IndexMap<String, ProcessConfig>,
    /// Top-level options consumed by the outer shell.
    pub options: GlobalOptions,
}

impl ResolvedConfig {
    /// Process names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.processes.keys().cloned().collect()
    }
}

/// Top-level options that stay global after validation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GlobalOptions {
    /// Stop every process when any one exits.
    pub kill_others: bool,
    /// Stop every process when any one exits with a failure.
    pub kill_others_on_fail: bool,
    /// Disable file watching for this run.
    pub no_watch: bool,
    /// Sort processes alphabetically for display.
    pub sort: bool,
    /// Prefix template for the line renderer (e.g. `[{name}]`).
    pub prefix: Option<String>,
    /// Prepend elapsed time to rendered lines.
    pub timestamps: bool,
    /// Directory for per-process log files.
    pub log_dir: Option<PathBuf>,
}

/// One resolved process entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Shell command, run as `sh -c <command>`.
    pub command: String,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment additions, applied on top of env-file values.
    pub env: HashMap<String, String>,
    /// Env files loaded before `env`, in order.
    pub env_files: Vec<PathBuf>,
    /// Names of processes that must be ready first.
    pub depends_on: Vec<String>,
    /// Readiness pattern matched against ANSI-stripped output.
    pub ready_pattern: Option<ReadyPattern>,
    /// Long-running service (`true`) or one-shot task (`false`).
    pub persistent: bool,
    /// Auto-restart cap; `None` means unbounded.
    pub max_restarts: Option<u32>,
    /// Deadline for the readiness pattern to match.
    pub ready_timeout: Option<Duration>,
    /// Delay before the first start.
    pub delay: Option<Duration>,
    /// Environment variable gating the start; leading `!` negates.
    pub condition: Option<String>,
    /// Platforms the process runs on; `None` means all.
    pub platforms: Option<Vec<Platform>>,
    /// Signal used for graceful stop.
    pub stop_signal: StopSignal,
    /// Prefix colors; round-robin for pattern-expanded siblings.
    pub colors: Vec<crate::color::Rgb>,
    /// Watch globs for the external file watcher.
    pub watch: Vec<String>,
    /// Forward keyboard input to this process.
    pub interactive: bool,
    /// Error-output detection mode.
    pub error_matcher: Option<ErrorMatcher>,
    /// Echo a dim `$ command` line on start.
    pub show_command: bool,
}

/// Readiness pattern, either authored as text in a config file or supplied
/// as a compiled regex through the API. Only the compiled form preserves
/// capture groups.
#[derive(Debug, Clone)]
pub enum ReadyPattern {
    /// Compiled from a config string; captures are not preserved.
    Text(Regex),
    /// Supplied programmatically; captures are preserved.
    Compiled(Regex),
}

impl ReadyPattern {
    /// The underlying regex.
    pub fn regex(&self) -> &Regex {
        match self {
            ReadyPattern::Text(re) | ReadyPattern::Compiled(re) => re,
        }
    }

    /// Whether capture groups are retained after the first match.
    pub fn keeps_captures(&self) -> bool {
        matches!(self, ReadyPattern::Compiled(_))
    }
}

impl PartialEq for ReadyPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ReadyPattern::Text(a), ReadyPattern::Text(b)) => a.as_str() == b.as_str(),
            (ReadyPattern::Compiled(a), ReadyPattern::Compiled(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Error-output detection mode.
#[derive(Debug, Clone)]
pub enum ErrorMatcher {
    /// Fire on any SGR sequence selecting red or bright red.
    AnsiRed,
    /// Fire when the regex matches the ANSI-stripped output.
    Pattern(Regex),
}

impl PartialEq for ErrorMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ErrorMatcher::AnsiRed, ErrorMatcher::AnsiRed) => true,
            (ErrorMatcher::Pattern(a), ErrorMatcher::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Graceful-stop signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    #[default]
    Term,
    Int,
    Hup,
}

impl StopSignal {
    /// Parses `SIGTERM`/`SIGINT`/`SIGHUP`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SIGTERM" => Some(StopSignal::Term),
            "SIGINT" => Some(StopSignal::Int),
            "SIGHUP" => Some(StopSignal::Hup),
            _ => None,
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopSignal::Term => "SIGTERM",
            StopSignal::Int => "SIGINT",
            StopSignal::Hup => "SIGHUP",
        }
    }

    /// OS signal number.
    #[cfg(unix)]
    pub fn number(&self) -> i32 {
        match self {
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Int => libc::SIGINT,
            StopSignal::Hup => libc::SIGHUP,
        }
    }
}

/// Platform gate values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Aix,
    Darwin,
    Freebsd,
    Linux,
    Openbsd,
    Sunos,
    Win32,
}

impl Platform {
    /// Parses a platform name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aix" => Some(Platform::Aix),
            "darwin" => Some(Platform::Darwin),
            "freebsd" => Some(Platform::Freebsd),
            "linux" => Some(Platform::Linux),
            "openbsd" => Some(Platform::Openbsd),
            "sunos" => Some(Platform::Sunos),
            "win32" => Some(Platform::Win32),
            _ => None,
        }
    }

    /// The platform numux is running on, when it is one of the gate values.
    pub fn current() -> Option<Self> {
        match std::env::consts::OS {
            "aix" => Some(Platform::Aix),
            "macos" => Some(Platform::Darwin),
            "freebsd" => Some(Platform::Freebsd),
            "linux" => Some(Platform::Linux),
            "openbsd" => Some(Platform::Openbsd),
            "solaris" | "illumos" => Some(Platform::Sunos),
            "windows" => Some(Platform::Win32),
            _ => None,
        }
    }
}

/// Locates a config file in `dir`, following the candidate order.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Reads a config file into the raw value tree.
///
/// `.ts`/`.js` configs are recognized but rejected: dynamic config evaluation
/// belongs to the Node-based loader, not this binary.
pub fn load_raw(path: &Path) -> Result<Value, Error> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if extension == "ts" || extension == "js" {
        return Err(Error::Config(format!(
            "cannot load {}: dynamic config files are not supported here, use YAML or JSON",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if file_name == "package.json" {
        let value: Value = parse_json(path, &content)?;
        return value
            .get("numux")
            .cloned()
            .ok_or_else(|| Error::Config(format!("{}: no \"numux\" key", path.display())));
    }

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|err| Error::ConfigParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
        _ => parse_json(path, &content),
    }
}

fn parse_json(path: &Path, content: &str) -> Result<Value, Error> {
    serde_json::from_str(content).map_err(|err| Error::ConfigParse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn stop_signal_round_trips() {
        for name in ["SIGTERM", "SIGINT", "SIGHUP"] {
            assert_eq!(StopSignal::parse(name).unwrap().as_str(), name);
        }
        assert!(StopSignal::parse("SIGKILL").is_none());
    }

    #[test]
    fn ready_pattern_equality_is_by_text_and_variant() {
        let a = ReadyPattern::Text(Regex::new("ready").unwrap());
        let b = ReadyPattern::Text(Regex::new("ready").unwrap());
        let c = ReadyPattern::Compiled(Regex::new("ready").unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_dynamic_config_files() {
        let err = load_raw(Path::new("numux.config.ts")).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn loads_yaml_into_value() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "processes:\n  api: echo hi").unwrap();
        let raw = load_raw(file.path()).unwrap();
        assert_eq!(raw["processes"]["api"], Value::String("echo hi".into()));
    }

    #[test]
    fn loads_numux_key_from_package_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(
            &path,
            r#"{"name": "app", "numux": {"processes": {"api": "echo hi"}}}"#,
        )
        .unwrap();
        let raw = load_raw(&path).unwrap();
        assert!(raw["processes"]["api"].is_string());

        std::fs::write(&path, r#"{"name": "app"}"#).unwrap();
        assert!(load_raw(&path).is_err());
    }

    #[test]
    fn find_config_follows_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("numux.json"), "{}").unwrap();
        std::fs::write(dir.path().join("numux.yaml"), "").unwrap();
        let found = find_config(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "numux.yaml");
    }
}
