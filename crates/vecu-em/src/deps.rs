//! Dependency-ordered startup.
//!
//! Computes the spawn order of the boot applications from their declared
//! dependencies. Misconfiguration never prevents startup: bad edges are
//! logged and ignored, and a dependency cycle falls back to manifest order.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;

use crate::manifest::AppConfig;

/// Spawn order for the `start_on_boot` applications.
///
/// An edge `d -> a` exists when `a` declares `d` as a dependency and `d` is
/// itself started at boot. Self-dependencies and unknown or non-boot
/// dependencies are ignored with a warning. On a cycle, the order falls
/// back to manifest order.
#[must_use]
pub fn startup_order(apps: &[AppConfig]) -> Vec<String> {
    let boot: Vec<&AppConfig> = apps.iter().filter(|a| a.start_on_boot).collect();
    let index: HashMap<&str, usize> = boot
        .iter()
        .enumerate()
        .map(|(i, a)| (a.app_id.as_str(), i))
        .collect();

    let mut dependents: Vec<HashSet<usize>> = vec![HashSet::new(); boot.len()];
    let mut indegree = vec![0usize; boot.len()];

    for (ai, app) in boot.iter().enumerate() {
        for dep in &app.dependencies {
            if *dep == app.app_id {
                warn!(app = %app.app_id, "ignoring self-dependency");
                continue;
            }
            match index.get(dep.as_str()) {
                Some(&di) => {
                    if dependents[di].insert(ai) {
                        indegree[ai] += 1;
                    }
                }
                None => {
                    warn!(
                        app = %app.app_id,
                        dependency = %dep,
                        "ignoring unknown or non-boot dependency"
                    );
                }
            }
        }
    }

    // Kahn's algorithm; the ready set is ordered by manifest position so
    // independent applications keep their manifest order.
    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(boot.len());

    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != boot.len() {
        warn!("dependency cycle detected, falling back to manifest order");
        return boot.iter().map(|a| a.app_id.clone()).collect();
    }

    order.into_iter().map(|i| boot[i].app_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(app_id: &str, start_on_boot: bool, dependencies: &[&str]) -> AppConfig {
        serde_json::from_str(&format!(
            r#"{{"app_id":{:?},"executable":"/bin/app","start_on_boot":{},"dependencies":{:?}}}"#,
            app_id, start_on_boot, dependencies
        ))
        .unwrap()
    }

    #[test]
    fn test_chain_orders_dependencies_first() {
        // C depends on B depends on A; manifest order is shuffled.
        let apps = vec![
            app("c", true, &["b"]),
            app("a", true, &[]),
            app("b", true, &["a"]),
        ];
        assert_eq!(startup_order(&apps), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_provider_before_client() {
        let apps = vec![
            app("provider", true, &[]),
            app("client", true, &["provider"]),
        ];
        assert_eq!(startup_order(&apps), vec!["provider", "client"]);
    }

    #[test]
    fn test_cycle_falls_back_to_manifest_order() {
        let apps = vec![
            app("a", true, &["b"]),
            app("b", true, &["a"]),
            app("c", true, &[]),
        ];
        assert_eq!(startup_order(&apps), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_and_unknown_dependencies_ignored() {
        let apps = vec![
            app("a", true, &["a", "ghost", "lazy"]),
            app("lazy", false, &[]),
            app("b", true, &["a"]),
        ];
        assert_eq!(startup_order(&apps), vec!["a", "b"]);
    }

    #[test]
    fn test_independent_apps_keep_manifest_order() {
        let apps = vec![app("z", true, &[]), app("m", true, &[]), app("a", true, &[])];
        assert_eq!(startup_order(&apps), vec!["z", "m", "a"]);
    }
}
