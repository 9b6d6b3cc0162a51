//! Dependency resolution: Kahn topological tiering with cycle reporting.

use std::collections::HashMap;

use crate::config::ResolvedConfig;
use crate::error::Error;

/// Groups processes into tiers: tier `k` holds exactly the processes whose
/// dependencies all live in tiers `0..k`.
///
/// Fails with a cycle trace (`a -> b -> a`) when the graph is not a DAG.
pub fn build_tiers(config: &ResolvedConfig) -> Result<Vec<Vec<String>>, Error> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, process) in &config.processes {
        in_degree.insert(name, process.depends_on.len());
        for dep in &process.depends_on {
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut tiers = Vec::new();
    let mut remaining = config.processes.len();
    while remaining > 0 {
        // Declaration order within a tier, for stable presentation.
        let tier: Vec<String> = config
            .processes
            .keys()
            .filter(|name| in_degree.get(name.as_str()) == Some(&0))
            .cloned()
            .collect();
        if tier.is_empty() {
            return Err(Error::Cycle(find_cycle(config, &in_degree)));
        }
        for name in &tier {
            in_degree.remove(name.as_str());
            for dependent in dependents.get(name.as_str()).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                }
            }
        }
        remaining -= tier.len();
        tiers.push(tier);
    }
    Ok(tiers)
}

/// Walks `dependsOn` edges inside the unresolved remainder until a vertex
/// repeats; the reported trace starts at that revisit.
fn find_cycle(config: &ResolvedConfig, remaining: &HashMap<&str, usize>) -> String {
    let start = config
        .processes
        .keys()
        .find(|name| remaining.contains_key(name.as_str()))
        .map(String::as_str)
        .unwrap_or_default();

    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    loop {
        if let Some(position) = path.iter().position(|seen| *seen == current) {
            let mut trace: Vec<&str> = path[position..].to_vec();
            trace.push(current);
            return trace.join(" -> ");
        }
        path.push(current);
        // Every remaining vertex has at least one unresolved dependency.
        current = config.processes[current]
            .depends_on
            .iter()
            .find(|dep| remaining.contains_key(dep.as_str()))
            .map(String::as_str)
            .unwrap_or(current);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::validate::validate;

    fn config(raw: serde_json::Value) -> ResolvedConfig {
        validate(&raw).unwrap().config
    }

    #[test]
    fn tiers_a_linear_chain() {
        let config = config(json!({
            "processes": {
                "db": "postgres",
                "migrate": {"command": "migrate", "dependsOn": "db"},
                "api": {"command": "serve", "dependsOn": "migrate"},
            }
        }));
        let tiers = build_tiers(&config).unwrap();
        assert_eq!(tiers, vec![vec!["db"], vec!["migrate"], vec!["api"]]);
    }

    #[test]
    fn tiers_a_diamond() {
        let config = config(json!({
            "processes": {
                "db": "postgres",
                "cache": "redis",
                "api": {"command": "serve", "dependsOn": ["db", "cache"]},
                "web": {"command": "web", "dependsOn": ["api"]},
            }
        }));
        let tiers = build_tiers(&config).unwrap();
        assert_eq!(tiers, vec![vec!["db", "cache"], vec!["api"], vec!["web"]]);
    }

    #[test]
    fn tier_union_covers_every_process_with_deps_in_earlier_tiers() {
        let config = config(json!({
            "processes": {
                "a": "x",
                "b": {"command": "x", "dependsOn": "a"},
                "c": {"command": "x", "dependsOn": ["a", "b"]},
                "d": "x",
                "e": {"command": "x", "dependsOn": ["d", "c"]},
            }
        }));
        let tiers = build_tiers(&config).unwrap();
        let mut tier_of = HashMap::new();
        for (index, tier) in tiers.iter().enumerate() {
            for name in tier {
                tier_of.insert(name.clone(), index);
            }
        }
        assert_eq!(tier_of.len(), config.processes.len());
        for (name, process) in &config.processes {
            for dep in &process.depends_on {
                assert!(tier_of[dep] < tier_of[name], "{dep} must precede {name}");
            }
        }
    }

    #[test]
    fn reports_cycles_with_a_trace() {
        let config = config(json!({
            "processes": {
                "a": {"command": "x", "dependsOn": "c"},
                "b": {"command": "x", "dependsOn": "a"},
                "c": {"command": "x", "dependsOn": "b"},
            }
        }));
        let message = build_tiers(&config).unwrap_err().to_string();
        assert!(message.contains("cycle"), "{message}");
        for name in ["a", "b", "c"] {
            assert!(message.contains(name), "{message} should name {name}");
        }
        // The trace closes on the vertex it started from.
        let trace = message.split(": ").nth(1).unwrap();
        let hops: Vec<&str> = trace.split(" -> ").collect();
        assert_eq!(hops.first(), hops.last());
        assert_eq!(hops.len(), 4);
    }

    #[test]
    fn cycle_below_a_valid_tier_is_still_found() {
        let config = config(json!({
            "processes": {
                "ok": "x",
                "a": {"command": "x", "dependsOn": ["b", "ok"]},
                "b": {"command": "x", "dependsOn": "a"},
            }
        }));
        let message = build_tiers(&config).unwrap_err().to_string();
        assert!(message.contains("a -> b -> a") || message.contains("b -> a -> b"));
    }
}
