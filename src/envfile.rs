//! Parsing of `KEY=VAL` env files.
//!
//! Supports comments, blank lines, an optional `export ` prefix and single or
//! double quoted values. No variable expansion happens here; expansion is the
//! interpolator's job and applies to config values, not env-file contents.

use std::path::Path;

use crate::error::Error;

/// Reads and parses an env file, preserving declaration order.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, Error> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::EnvFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_env(&content))
}

/// Parses env-file content into key/value pairs. Malformed lines are skipped.
pub fn parse_env(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !is_valid_key(key) {
            continue;
        }
        vars.push((key.to_string(), unquote(value.trim())));
    }
    vars
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}
