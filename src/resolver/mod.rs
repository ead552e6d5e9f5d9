use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::store::model::Package;

/// Lookup tables from log paths to the owning package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryMap {
    by_path: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl BinaryMap {
    pub fn build(packages: &[Package]) -> Self {
        let mut map = Self::default();

        // Package-name fallbacks first so a real binary basename always wins.
        for package in packages {
            map.by_name.insert(package.name.clone(), package.name.clone());
        }

        for package in packages {
            for binary in &package.binaries {
                map.by_path.insert(binary.clone(), package.name.clone());
                if let Some(name) = basename(binary) {
                    map.by_name.insert(name.to_string(), package.name.clone());
                }
            }
        }
        map
    }

    pub fn path_count(&self) -> usize {
        self.by_path.len()
    }

    pub fn name_count(&self) -> usize {
        self.by_name.len()
    }

    /// Exact path, then `<prefix>/bin/<basename>` for each prefix, then the
    /// basename alone.
    pub fn resolve(&self, logged_path: &str, prefixes: &[PathBuf]) -> Option<&str> {
        if let Some(pkg) = self.by_path.get(logged_path) {
            return Some(pkg.as_str());
        }

        let name = basename(logged_path)?;
        for prefix in prefixes {
            let qualified = prefix.join("bin").join(name);
            if let Some(pkg) = qualified.to_str().and_then(|path| self.by_path.get(path)) {
                return Some(pkg.as_str());
            }
        }

        self.by_name.get(name).map(String::as_str)
    }
}

fn basename(path: &str) -> Option<&str> {
    Path::new(path)
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::InstallReason;
    use chrono::{TimeZone, Utc};

    fn package(name: &str, binaries: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            installed_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            reason: InstallReason::Explicit,
            has_binaries: !binaries.is_empty(),
            binaries: binaries.iter().map(|b| b.to_string()).collect(),
            size_bytes: 0,
        }
    }

    fn prefixes() -> Vec<PathBuf> {
        vec![PathBuf::from("/opt/homebrew"), PathBuf::from("/usr/local")]
    }

    #[test]
    fn maps_full_paths_and_basenames() {
        let map = BinaryMap::build(&[package(
            "ripgrep",
            &["/opt/homebrew/bin/rg", "/opt/homebrew/bin/rg-helper"],
        )]);
        assert_eq!(map.path_count(), 2);
        assert_eq!(map.resolve("/opt/homebrew/bin/rg", &prefixes()), Some("ripgrep"));
        assert_eq!(map.resolve("/Users/me/.pruneguard/bin/rg", &prefixes()), Some("ripgrep"));
        assert_eq!(map.resolve("rg", &prefixes()), Some("ripgrep"));
    }

    #[test]
    fn prefix_qualified_path_disambiguates_shared_basenames() {
        let map = BinaryMap::build(&[
            package("coreutils", &["/opt/homebrew/bin/ls"]),
            package("uutils", &["/usr/local/bin/ls"]),
        ]);
        let first_prefix_only = vec![PathBuf::from("/usr/local")];
        assert_eq!(
            map.resolve("/home/me/.pruneguard/bin/ls", &first_prefix_only),
            Some("uutils")
        );
        assert_eq!(
            map.resolve("/home/me/.pruneguard/bin/ls", &prefixes()),
            Some("coreutils")
        );
    }

    #[test]
    fn package_name_is_a_fallback_when_binaries_are_missing() {
        let map = BinaryMap::build(&[package("jq", &[])]);
        assert_eq!(map.resolve("/shims/jq", &prefixes()), Some("jq"));
    }

    #[test]
    fn binary_basename_beats_package_name_fallback() {
        let map = BinaryMap::build(&[
            package("make", &[]),
            package("remake", &["/opt/homebrew/bin/make"]),
        ]);
        assert_eq!(map.resolve("make", &[]), Some("remake"));
    }

    #[test]
    fn unknown_binaries_do_not_resolve() {
        let map = BinaryMap::build(&[package("jq", &["/opt/homebrew/bin/jq"])]);
        assert_eq!(map.resolve("/shims/uninstalled-tool", &prefixes()), None);
        assert_eq!(map.resolve("", &prefixes()), None);
    }
}
