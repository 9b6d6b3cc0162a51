//! Structural diff of two resolved configs, used by reload flows.

use serde::Serialize;

use crate::config::ResolvedConfig;

/// Names of processes that were added, removed or modified between two
/// resolved configs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ConfigDiff {
    /// Whether the two configs describe the same process set.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compares per-process records by deep structural equality.
pub fn diff_configs(old: &ResolvedConfig, new: &ResolvedConfig) -> ConfigDiff {
    let mut diff = ConfigDiff::default();
    for (name, process) in &new.processes {
        match old.processes.get(name) {
            None => diff.added.push(name.clone()),
            Some(previous) if previous != process => diff.modified.push(name.clone()),
            Some(_) => {}
        }
    }
    for name in old.processes.keys() {
        if !new.processes.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }
    diff
}
