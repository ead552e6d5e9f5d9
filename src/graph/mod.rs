use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use crate::store::UsageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow `package -> depends_on` edges.
    Dependencies,
    /// Follow `depends_on -> package` edges.
    Dependents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyChain {
    pub root: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

/// Breadth-first closure from `root`, excluding `root` itself. Every name is
/// expanded at most once, so cyclic graphs terminate.
pub fn closure<S: UsageStore + ?Sized>(
    store: &S,
    root: &str,
    direction: Direction,
) -> rusqlite::Result<Vec<String>> {
    let mut queue = VecDeque::from([root.to_string()]);
    let mut visited = HashSet::from([root.to_string()]);
    let mut out = Vec::new();

    while let Some(name) = queue.pop_front() {
        let next = match direction {
            Direction::Dependencies => store.get_dependencies(&name)?,
            Direction::Dependents => store.get_dependents(&name)?,
        };
        for neighbour in next {
            if visited.insert(neighbour.clone()) {
                out.push(neighbour.clone());
                queue.push_back(neighbour);
            }
        }
    }
    Ok(out)
}

pub fn dependency_chain<S: UsageStore + ?Sized>(
    store: &S,
    root: &str,
) -> rusqlite::Result<DependencyChain> {
    Ok(DependencyChain {
        root: root.to_string(),
        dependencies: closure(store, root, Direction::Dependencies)?,
        dependents: closure(store, root, Direction::Dependents)?,
    })
}

/// Installed packages nothing else depends on.
pub fn leaves<S: UsageStore + ?Sized>(store: &S) -> rusqlite::Result<Vec<String>> {
    let mut out = Vec::new();
    for package in store.list_packages()? {
        if store.get_dependents(&package.name)?.is_empty() {
            out.push(package.name);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::store::model::{DependencyEdge, InstallReason, Package};
    use chrono::{TimeZone, Utc};

    fn package(name: &str) -> Package {
        Package {
            name: name.to_string(),
            installed_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            reason: InstallReason::Dependency,
            has_binaries: false,
            binaries: Vec::new(),
            size_bytes: 0,
        }
    }

    fn store_with(names: &[&str], edges: &[(&str, &str)]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("sqlite");
        let packages: Vec<Package> = names.iter().map(|name| package(name)).collect();
        let edges: Vec<DependencyEdge> = edges
            .iter()
            .map(|(from, to)| DependencyEdge {
                package: from.to_string(),
                depends_on: to.to_string(),
            })
            .collect();
        store.replace_inventory(&packages, &edges).expect("inventory");
        store
    }

    #[test]
    fn follows_transitive_dependencies_breadth_first() {
        let store = store_with(
            &["app", "lib-a", "lib-b", "base"],
            &[("app", "lib-a"), ("app", "lib-b"), ("lib-a", "base"), ("lib-b", "base")],
        );
        let deps = closure(&store, "app", Direction::Dependencies).expect("closure");
        assert_eq!(deps, vec!["lib-a", "lib-b", "base"]);

        let dependents = closure(&store, "base", Direction::Dependents).expect("closure");
        assert_eq!(dependents, vec!["lib-a", "lib-b", "app"]);
    }

    #[test]
    fn cycle_terminates_with_finite_nonempty_chain() {
        let store = store_with(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let chain = dependency_chain(&store, "a").expect("chain");
        assert_eq!(chain.dependencies, vec!["b", "c"]);
        assert_eq!(chain.dependents, vec!["c", "b"]);
    }

    #[test]
    fn self_loop_is_ignored() {
        let store = store_with(&["solo"], &[("solo", "solo")]);
        assert!(closure(&store, "solo", Direction::Dependencies).expect("closure").is_empty());
    }

    #[test]
    fn leaves_are_packages_without_dependents() {
        let store = store_with(&["app", "lib", "tool"], &[("app", "lib")]);
        assert_eq!(leaves(&store).expect("leaves"), vec!["app", "tool"]);
    }

    #[test]
    fn missing_dependency_targets_are_listed_but_not_expanded() {
        let store = store_with(&["app"], &[("app", "not-installed")]);
        assert_eq!(
            closure(&store, "app", Direction::Dependencies).expect("closure"),
            vec!["not-installed"]
        );
    }
}
