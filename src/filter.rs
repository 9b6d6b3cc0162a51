//! Config filters: `--only`, `--exclude` and platform gating.
//!
//! Filters never mutate their input; each produces a new config with
//! `dependsOn` lists pruned to the surviving process set.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::config::{Platform, ResolvedConfig};
use crate::error::Error;

/// Keeps `names` plus the transitive closure of their dependencies.
///
/// An empty `names` list keeps everything. Unknown names are rejected.
pub fn filter_only(config: &ResolvedConfig, names: &[String]) -> Result<ResolvedConfig, Error> {
    if names.is_empty() {
        return Ok(config.clone());
    }
    for name in names {
        if !config.processes.contains_key(name) {
            return Err(Error::UnknownProcess(name.clone()));
        }
    }

    let mut keep: HashSet<String> = HashSet::new();
    let mut queue: Vec<String> = names.to_vec();
    while let Some(name) = queue.pop() {
        if !keep.insert(name.clone()) {
            continue;
        }
        queue.extend(config.processes[&name].depends_on.iter().cloned());
    }

    Ok(retain(config, &keep))
}

/// Removes `names`; dependents survive with pruned `dependsOn` lists.
pub fn filter_exclude(config: &ResolvedConfig, names: &[String]) -> Result<ResolvedConfig, Error> {
    for name in names {
        if !config.processes.contains_key(name) {
            return Err(Error::UnknownProcess(name.clone()));
        }
    }
    let keep: HashSet<String> = config
        .processes
        .keys()
        .filter(|name| !names.contains(name))
        .cloned()
        .collect();
    if keep.is_empty() {
        return Err(Error::Config("no processes left after filtering".into()));
    }
    Ok(retain(config, &keep))
}

/// Removes processes whose `platform` gate excludes `current`.
///
/// A platform-unavailable prerequisite simply disappears: dependents survive
/// with the entry pruned out of their `dependsOn`, so they still start.
pub fn filter_by_platform(
    config: &ResolvedConfig,
    current: Option<Platform>,
) -> Result<ResolvedConfig, Error> {
    let keep: HashSet<String> = config
        .processes
        .iter()
        .filter(|(_, process)| match (&process.platforms, current) {
            (None, _) => true,
            (Some(platforms), Some(current)) => platforms.contains(&current),
            (Some(_), None) => false,
        })
        .map(|(name, _)| name.clone())
        .collect();
    if keep.is_empty() {
        return Err(Error::Config("no processes left after filtering".into()));
    }
    Ok(retain(config, &keep))
}

fn retain(config: &ResolvedConfig, keep: &HashSet<String>) -> ResolvedConfig {
    let mut processes = IndexMap::with_capacity(keep.len());
    for (name, process) in &config.processes {
        if !keep.contains(name) {
            continue;
        }
        let mut process = process.clone();
        process.depends_on.retain(|dep| keep.contains(dep));
        processes.insert(name.clone(), process);
    }
    ResolvedConfig {
        processes,
        options: config.options.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::validate::validate;

    fn config() -> ResolvedConfig {
        validate(&json!({
            "processes": {
                "db": "postgres",
                "cache": "redis",
                "api": {"command": "serve", "dependsOn": ["db", "cache"]},
                "web": {"command": "web", "dependsOn": "api"},
                "docs": "mkdocs",
            }
        }))
        .unwrap()
        .config
    }

    fn names(config: &ResolvedConfig) -> Vec<&str> {
        config.processes.keys().map(String::as_str).collect()
    }

    #[test]
    fn only_keeps_transitive_dependencies() {
        let filtered = filter_only(&config(), &["api".to_string()]).unwrap();
        assert_eq!(names(&filtered), vec!["db", "cache", "api"]);
    }

    #[test]
    fn only_with_all_names_is_identity() {
        let config = config();
        let filtered = filter_only(&config, &config.names()).unwrap();
        assert_eq!(filtered, config);
    }

    #[test]
    fn only_with_empty_list_keeps_everything() {
        let config = config();
        assert_eq!(filter_only(&config, &[]).unwrap(), config);
    }

    #[test]
    fn only_rejects_unknown_names() {
        let err = filter_only(&config(), &["nope".to_string()]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn exclude_prunes_dependents() {
        let filtered = filter_exclude(&config(), &["cache".to_string()]).unwrap();
        assert_eq!(filtered.processes["api"].depends_on, vec!["db"]);
        assert!(!filtered.processes.contains_key("cache"));
    }

    #[test]
    fn exclude_can_empty_a_depends_on_list() {
        let filtered =
            filter_exclude(&config(), &["db".to_string(), "cache".to_string()]).unwrap();
        assert!(filtered.processes["api"].depends_on.is_empty());
    }

    #[test]
    fn exclude_rejects_unknown_and_refuses_to_empty_the_set() {
        assert!(filter_exclude(&config(), &["nope".to_string()]).is_err());
        let all = config().names();
        assert!(filter_exclude(&config(), &all).is_err());
    }

    #[test]
    fn platform_filter_drops_gated_processes_but_keeps_dependents() {
        let config = validate(&json!({
            "processes": {
                "winsvc": {"command": "svc", "platform": "win32"},
                "api": {"command": "serve", "dependsOn": "winsvc"},
            }
        }))
        .unwrap()
        .config;
        let filtered = filter_by_platform(&config, Some(Platform::Linux)).unwrap();
        assert_eq!(names(&filtered), vec!["api"]);
        assert!(filtered.processes["api"].depends_on.is_empty());
    }

    #[test]
    fn platform_filter_keeps_matching_processes() {
        let config = validate(&json!({
            "processes": {
                "svc": {"command": "svc", "platform": ["linux", "darwin"]},
            }
        }))
        .unwrap()
        .config;
        assert!(filter_by_platform(&config, Some(Platform::Linux)).is_ok());
        assert!(filter_by_platform(&config, Some(Platform::Win32)).is_err());
    }
}
