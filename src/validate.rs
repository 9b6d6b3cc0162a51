//! Raw configuration validation and normalization.
//!
//! This is the single place where untyped input becomes typed resolved
//! values: string shorthands are expanded, globals are inherited, every
//! option is typechecked, and non-fatal oddities are collected as warnings.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

use crate::color::{self, Rgb};
use crate::config::{
    ErrorMatcher, GlobalOptions, Platform, ProcessConfig, ReadyPattern, ResolvedConfig,
    StopSignal,
};
use crate::error::Error;

/// Validation output: the resolved config plus non-fatal warnings.
#[derive(Debug)]
pub struct Validated {
    pub config: ResolvedConfig,
    pub warnings: Vec<String>,
}

const GLOBAL_KEYS: [&str; 18] = [
    "cwd",
    "env",
    "envFile",
    "showCommand",
    "maxRestarts",
    "readyTimeout",
    "persistent",
    "stopSignal",
    "errorMatcher",
    "watch",
    "sort",
    "prefix",
    "timestamps",
    "killOthers",
    "killOthersOnFail",
    "noWatch",
    "logDir",
    "processes",
];

const PROCESS_KEYS: [&str; 18] = [
    "command",
    "cwd",
    "env",
    "envFile",
    "dependsOn",
    "readyPattern",
    "persistent",
    "maxRestarts",
    "readyTimeout",
    "delay",
    "condition",
    "platform",
    "stopSignal",
    "color",
    "watch",
    "interactive",
    "errorMatcher",
    "showCommand",
];

/// Inherited defaults parsed from the top level of the raw config.
#[derive(Debug, Default)]
struct Globals {
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    env_files: Option<Vec<PathBuf>>,
    show_command: Option<bool>,
    max_restarts: Option<u32>,
    ready_timeout: Option<Duration>,
    persistent: Option<bool>,
    stop_signal: Option<StopSignal>,
    error_matcher: Option<ErrorMatcher>,
    watch: Vec<String>,
}

/// Validates a raw config value, producing a [`ResolvedConfig`].
pub fn validate(raw: &Value) -> Result<Validated, Error> {
    let root = raw
        .as_object()
        .ok_or_else(|| Error::Config("configuration must be a mapping".into()))?;
    let mut warnings = Vec::new();

    for key in root.keys() {
        if !GLOBAL_KEYS.contains(&key.as_str()) {
            warnings.push(format!("ignoring unknown option `{key}`"));
        }
    }

    let globals = parse_globals(root, &mut warnings)?;
    let options = parse_options(root, &mut warnings)?;

    let table = root
        .get("processes")
        .and_then(Value::as_object)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Config("configuration has no processes".into()))?;

    let names: HashSet<&str> = table.keys().map(String::as_str).collect();
    let mut processes = IndexMap::with_capacity(table.len());
    for (name, entry) in table {
        let process = match entry {
            Value::String(command) => {
                command_only(name, command, &globals)?
            }
            Value::Object(record) => {
                parse_process(name, record, &globals, &names, &mut warnings)?
            }
            _ => {
                return Err(Error::Config(format!(
                    "process '{name}': must be a command string or a mapping"
                )))
            }
        };
        processes.insert(name.clone(), process);
    }

    Ok(Validated {
        config: ResolvedConfig { processes, options },
        warnings,
    })
}

fn command_only(name: &str, command: &str, globals: &Globals) -> Result<ProcessConfig, Error> {
    if command.trim().is_empty() {
        return Err(Error::Config(format!(
            "process '{name}': command is missing or empty"
        )));
    }
    Ok(ProcessConfig {
        command: command.to_string(),
        cwd: globals.cwd.clone(),
        env: globals.env.clone(),
        env_files: globals.env_files.clone().unwrap_or_default(),
        depends_on: Vec::new(),
        ready_pattern: None,
        persistent: globals.persistent.unwrap_or(true),
        max_restarts: globals.max_restarts,
        ready_timeout: globals.ready_timeout,
        delay: None,
        condition: None,
        platforms: None,
        stop_signal: globals.stop_signal.unwrap_or_default(),
        colors: Vec::new(),
        watch: globals.watch.clone(),
        interactive: false,
        error_matcher: globals.error_matcher.clone(),
        show_command: globals.show_command.unwrap_or(true),
    })
}

fn parse_process(
    name: &str,
    record: &serde_json::Map<String, Value>,
    globals: &Globals,
    names: &HashSet<&str>,
    warnings: &mut Vec<String>,
) -> Result<ProcessConfig, Error> {
    for key in record.keys() {
        if !PROCESS_KEYS.contains(&key.as_str()) {
            warnings.push(format!("process '{name}': ignoring unknown option `{key}`"));
        }
    }

    let command = match record.get("command") {
        Some(Value::String(cmd)) if !cmd.trim().is_empty() => cmd.clone(),
        Some(Value::String(_)) | None => {
            if is_pattern_name(name) {
                return Err(Error::Config(format!(
                    "process '{name}': patterns must be expanded before validation"
                )));
            }
            return Err(Error::Config(format!(
                "process '{name}': command is missing or empty"
            )));
        }
        Some(_) => {
            return Err(Error::Config(format!(
                "process '{name}': command must be a string"
            )))
        }
    };

    let mut process = command_only(name, &command, globals)?;

    if let Some(value) = record.get("cwd") {
        process.cwd = Some(PathBuf::from(expect_string(name, "cwd", value)?));
    }

    if let Some(value) = record.get("env") {
        let map = value.as_object().ok_or_else(|| {
            Error::Config(format!("process '{name}': env must be a mapping"))
        })?;
        for (key, entry) in map {
            let Value::String(text) = entry else {
                return Err(Error::Config(format!(
                    "process '{name}': env value for {key} must be a string"
                )));
            };
            process.env.insert(key.clone(), text.clone());
        }
    }

    if let Some(value) = record.get("envFile") {
        process.env_files = match value {
            Value::Bool(false) => Vec::new(),
            other => expect_string_or_list(name, "envFile", other)?
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        };
    }

    if let Some(value) = record.get("dependsOn") {
        let deps = expect_string_or_list(name, "dependsOn", value)?;
        for dep in &deps {
            if dep == name {
                return Err(Error::Config(format!(
                    "process '{name}': depends on itself"
                )));
            }
            if !names.contains(dep.as_str()) {
                return Err(Error::Config(format!(
                    "process '{name}': dependsOn references unknown process '{dep}'"
                )));
            }
        }
        process.depends_on = deps;
    }

    if let Some(value) = record.get("readyPattern") {
        let pattern = expect_string(name, "readyPattern", value)?;
        let regex = Regex::new(&pattern).map_err(|_| {
            Error::Config(format!(
                "process '{name}': invalid readyPattern /{pattern}/"
            ))
        })?;
        process.ready_pattern = Some(ReadyPattern::Text(regex));
    }

    if let Some(flag) = opt_bool(record.get("persistent"), name, "persistent", warnings) {
        process.persistent = flag;
    }
    if process.ready_pattern.is_some() && !process.persistent {
        warnings.push(format!(
            "process '{name}': readyPattern ignored — readiness is determined by exit code"
        ));
    }

    if let Some(value) = record.get("maxRestarts") {
        process.max_restarts = non_negative_u32(value).or(process.max_restarts);
    }
    if let Some(value) = record.get("readyTimeout") {
        process.ready_timeout = positive_millis(value).or(process.ready_timeout);
    }
    if let Some(value) = record.get("delay") {
        process.delay = positive_millis(value);
    }

    if let Some(value) = record.get("condition") {
        process.condition = Some(expect_string(name, "condition", value)?);
    }

    if let Some(value) = record.get("platform") {
        let entries = expect_string_or_list(name, "platform", value)?;
        let mut platforms = Vec::with_capacity(entries.len());
        for entry in entries {
            platforms.push(Platform::parse(&entry).ok_or_else(|| {
                Error::Config(format!("process '{name}': invalid platform '{entry}'"))
            })?);
        }
        process.platforms = Some(platforms);
    }

    if let Some(value) = record.get("stopSignal") {
        let signal = expect_string(name, "stopSignal", value)?;
        process.stop_signal = StopSignal::parse(&signal).ok_or_else(|| {
            Error::Config(format!("process '{name}': invalid stopSignal '{signal}'"))
        })?;
    }

    if let Some(value) = record.get("color") {
        let entries = expect_string_or_list(name, "color", value)?;
        let mut colors = Vec::with_capacity(entries.len());
        for entry in entries {
            colors.push(parse_color(name, &entry)?);
        }
        process.colors = colors;
    }

    if let Some(value) = record.get("watch") {
        process.watch = expect_string_or_list(name, "watch", value)?;
    }

    if let Some(flag) = opt_bool(record.get("interactive"), name, "interactive", warnings) {
        process.interactive = flag;
    }
    if let Some(flag) = opt_bool(record.get("showCommand"), name, "showCommand", warnings) {
        process.show_command = flag;
    }

    if let Some(value) = record.get("errorMatcher") {
        process.error_matcher = parse_error_matcher(value, &format!("process '{name}': "))?;
    }

    Ok(process)
}

fn parse_globals(
    root: &serde_json::Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Result<Globals, Error> {
    let mut globals = Globals::default();

    if let Some(value) = root.get("cwd") {
        globals.cwd = Some(PathBuf::from(expect_string("", "cwd", value)?));
    }
    if let Some(value) = root.get("env") {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Config("env must be a mapping".into()))?;
        for (key, entry) in map {
            let Value::String(text) = entry else {
                return Err(Error::Config(format!(
                    "env value for {key} must be a string"
                )));
            };
            globals.env.insert(key.clone(), text.clone());
        }
    }
    if let Some(value) = root.get("envFile") {
        globals.env_files = match value {
            Value::Bool(false) => Some(Vec::new()),
            other => Some(
                expect_string_or_list("", "envFile", other)?
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            ),
        };
    }
    globals.show_command = opt_bool(root.get("showCommand"), "", "showCommand", warnings);
    globals.persistent = opt_bool(root.get("persistent"), "", "persistent", warnings);
    if let Some(value) = root.get("maxRestarts") {
        globals.max_restarts = non_negative_u32(value);
    }
    if let Some(value) = root.get("readyTimeout") {
        globals.ready_timeout = positive_millis(value);
    }
    if let Some(value) = root.get("stopSignal") {
        let signal = expect_string("", "stopSignal", value)?;
        globals.stop_signal = Some(StopSignal::parse(&signal).ok_or_else(|| {
            Error::Config(format!("invalid stopSignal '{signal}'"))
        })?);
    }
    if let Some(value) = root.get("errorMatcher") {
        globals.error_matcher = parse_error_matcher(value, "")?;
    }
    if let Some(value) = root.get("watch") {
        globals.watch = expect_string_or_list("", "watch", value)?;
    }

    Ok(globals)
}

fn parse_options(
    root: &serde_json::Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Result<GlobalOptions, Error> {
    let prefix = match root.get("prefix") {
        Some(value) => Some(expect_string("", "prefix", value)?),
        None => None,
    };
    let log_dir = match root.get("logDir") {
        Some(value) => Some(PathBuf::from(expect_string("", "logDir", value)?)),
        None => None,
    };
    Ok(GlobalOptions {
        kill_others: opt_bool(root.get("killOthers"), "", "killOthers", warnings)
            .unwrap_or(false),
        kill_others_on_fail: opt_bool(
            root.get("killOthersOnFail"),
            "",
            "killOthersOnFail",
            warnings,
        )
        .unwrap_or(false),
        no_watch: opt_bool(root.get("noWatch"), "", "noWatch", warnings).unwrap_or(false),
        sort: opt_bool(root.get("sort"), "", "sort", warnings).unwrap_or(false),
        timestamps: opt_bool(root.get("timestamps"), "", "timestamps", warnings)
            .unwrap_or(false),
        prefix,
        log_dir,
    })
}

fn parse_error_matcher(value: &Value, context: &str) -> Result<Option<ErrorMatcher>, Error> {
    match value {
        Value::Bool(true) => Ok(Some(ErrorMatcher::AnsiRed)),
        Value::Bool(false) | Value::Null => Ok(None),
        Value::String(pattern) => {
            let regex = Regex::new(pattern).map_err(|_| {
                Error::Config(format!("{context}invalid errorMatcher /{pattern}/"))
            })?;
            Ok(Some(ErrorMatcher::Pattern(regex)))
        }
        _ => Err(Error::Config(format!(
            "{context}errorMatcher must be true, false or a regex string"
        ))),
    }
}

fn parse_color(name: &str, value: &str) -> Result<Rgb, Error> {
    color::parse_color(value)
        .ok_or_else(|| Error::Config(format!("process '{name}': invalid color '{value}'")))
}

fn is_pattern_name(name: &str) -> bool {
    name.starts_with("npm:") || name.contains(['*', '?', '['])
}

fn context(name: &str) -> String {
    if name.is_empty() {
        String::new()
    } else {
        format!("process '{name}': ")
    }
}

fn expect_string(name: &str, key: &str, value: &Value) -> Result<String, Error> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("{}{key} must be a string", context(name))))
}

fn expect_string_or_list(name: &str, key: &str, value: &Value) -> Result<Vec<String>, Error> {
    match value {
        Value::String(text) => Ok(vec![text.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    Error::Config(format!(
                        "{}{key} must be a string or a list of strings",
                        context(name)
                    ))
                })
            })
            .collect(),
        _ => Err(Error::Config(format!(
            "{}{key} must be a string or a list of strings",
            context(name)
        ))),
    }
}

fn opt_bool(
    value: Option<&Value>,
    name: &str,
    key: &str,
    warnings: &mut Vec<String>,
) -> Option<bool> {
    match value {
        Some(Value::Bool(flag)) => Some(*flag),
        Some(_) => {
            warnings.push(format!("{}{key} must be a boolean, ignored", context(name)));
            None
        }
        None => None,
    }
}

fn positive_millis(value: &Value) -> Option<Duration> {
    let ms = value.as_f64()?;
    if ms > 0.0 && ms.fract() == 0.0 {
        Some(Duration::from_millis(ms as u64))
    } else {
        None
    }
}

fn non_negative_u32(value: &Value) -> Option<u32> {
    let n = value.as_f64()?;
    if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 {
        Some(n as u32)
    } else {
        None
    }
}
