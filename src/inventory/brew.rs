use std::cell::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use super::{InventoryFile, PackageManager, PackageManagerError};
use crate::store::model::{DependencyEdge, InstallReason, Package};

const INFO_ARGS: &[&str] = &["info", "--json=v2", "--installed"];

#[derive(Debug, Deserialize)]
struct BrewInfo {
    #[serde(default)]
    formulae: Vec<BrewFormula>,
}

#[derive(Debug, Deserialize)]
struct BrewFormula {
    name: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    installed: Vec<BrewInstall>,
}

#[derive(Debug, Deserialize)]
struct BrewInstall {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    installed_as_dependency: bool,
    #[serde(default)]
    installed_on_request: bool,
}

/// Homebrew driven through its CLI. `brew info` runs at most once per
/// instance.
#[derive(Debug)]
pub struct BrewCli {
    program: PathBuf,
    prefix: PathBuf,
    snapshot: OnceCell<InventoryFile>,
}

impl BrewCli {
    pub fn new(program: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix: prefix.into(),
            snapshot: OnceCell::new(),
        }
    }

    /// First prefix that carries a `bin/brew`.
    pub fn detect(prefixes: &[PathBuf]) -> Result<Self, PackageManagerError> {
        prefixes
            .iter()
            .find(|prefix| prefix.join("bin").join("brew").is_file())
            .map(|prefix| Self::new(prefix.join("bin").join("brew"), prefix))
            .ok_or_else(|| PackageManagerError::NotFound {
                searched: prefixes
                    .iter()
                    .map(|prefix| prefix.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            })
    }

    fn snapshot(&self) -> Result<&InventoryFile, PackageManagerError> {
        if let Some(snapshot) = self.snapshot.get() {
            return Ok(snapshot);
        }
        let raw = self.run(INFO_ARGS)?;
        let snapshot = parse_info(&raw, &self.prefix)?;
        debug!(
            packages = snapshot.packages.len(),
            edges = snapshot.dependencies.len(),
            "read brew inventory"
        );
        Ok(self.snapshot.get_or_init(|| snapshot))
    }

    fn run(&self, args: &[&str]) -> Result<String, PackageManagerError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| PackageManagerError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(PackageManagerError::Command {
                program: self.program.clone(),
                args: args.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PackageManager for BrewCli {
    fn list_installed(&self) -> Result<Vec<Package>, PackageManagerError> {
        Ok(self.snapshot()?.packages.clone())
    }

    fn dependency_edges(&self) -> Result<Vec<DependencyEdge>, PackageManagerError> {
        Ok(self.snapshot()?.dependencies.clone())
    }

    fn uninstall(&self, name: &str) -> Result<(), PackageManagerError> {
        self.run(&["uninstall", name]).map(|_| ())
    }
}

/// Converts `brew info --json=v2 --installed` output. Binaries are the
/// entries of the keg's `bin/` reported at their linked `<prefix>/bin` path.
fn parse_info(raw: &str, prefix: &Path) -> Result<InventoryFile, PackageManagerError> {
    let info: BrewInfo = serde_json::from_str(raw)?;
    let mut inventory = InventoryFile::default();
    for formula in info.formulae {
        let Some(latest) = formula.installed.iter().max_by_key(|install| install.time) else {
            continue;
        };
        let reason = if latest.installed_as_dependency && !latest.installed_on_request {
            InstallReason::Dependency
        } else {
            InstallReason::Explicit
        };
        let installed_at = latest
            .time
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_default();
        let binaries = keg_binaries(prefix, &formula.name);

        for dependency in &formula.dependencies {
            inventory.dependencies.push(DependencyEdge {
                package: formula.name.clone(),
                depends_on: dependency.clone(),
            });
        }
        inventory.packages.push(Package {
            installed_at,
            reason,
            has_binaries: !binaries.is_empty(),
            binaries,
            size_bytes: keg_size(&prefix.join("Cellar").join(&formula.name)),
            name: formula.name,
        });
    }
    Ok(inventory)
}

fn keg_binaries(prefix: &Path, name: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(prefix.join("opt").join(name).join("bin")) else {
        return Vec::new();
    };
    let linked = prefix.join("bin");
    let mut binaries: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .map(|file_name| linked.join(file_name).to_string_lossy().into_owned())
        .collect();
    binaries.sort();
    binaries
}

/// Total bytes of regular files under `keg`; unreadable entries are skipped.
pub fn keg_size(keg: &Path) -> u64 {
    WalkDir::new(keg)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
  "formulae": [
    {
      "name": "jq",
      "full_name": "jq",
      "dependencies": ["oniguruma"],
      "installed": [
        {"version": "1.7", "time": 1700000000, "installed_as_dependency": false, "installed_on_request": true}
      ]
    },
    {
      "name": "oniguruma",
      "dependencies": [],
      "installed": [
        {"version": "6.9.8", "time": 1690000000, "installed_as_dependency": true, "installed_on_request": false},
        {"version": "6.9.9", "time": 1695000000, "installed_as_dependency": true, "installed_on_request": false}
      ]
    },
    {
      "name": "not-installed",
      "dependencies": ["jq"],
      "installed": []
    }
  ],
  "casks": []
}"#;

    fn fake_prefix() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let jq_bin = dir.path().join("opt/jq/bin");
        fs::create_dir_all(&jq_bin).expect("opt bin");
        fs::write(jq_bin.join("jq"), "#!/bin/sh\n").expect("jq");
        let cellar = dir.path().join("Cellar/jq/1.7/bin");
        fs::create_dir_all(&cellar).expect("cellar");
        fs::write(cellar.join("jq"), vec![0u8; 300]).expect("keg file");
        fs::write(dir.path().join("Cellar/jq/1.7/README"), vec![0u8; 100]).expect("readme");
        dir
    }

    #[test]
    fn parses_installed_formulae_with_binaries_and_sizes() {
        let prefix = fake_prefix();
        let inventory = parse_info(SAMPLE, prefix.path()).expect("parse");

        assert_eq!(inventory.packages.len(), 2);
        let jq = &inventory.packages[0];
        assert_eq!(jq.name, "jq");
        assert_eq!(jq.reason, InstallReason::Explicit);
        assert_eq!(jq.installed_at.timestamp(), 1_700_000_000);
        assert!(jq.has_binaries);
        assert_eq!(
            jq.binaries,
            vec![prefix.path().join("bin/jq").to_string_lossy().into_owned()]
        );
        assert_eq!(jq.size_bytes, 400);

        let oniguruma = &inventory.packages[1];
        assert_eq!(oniguruma.reason, InstallReason::Dependency);
        assert_eq!(oniguruma.installed_at.timestamp(), 1_695_000_000);
        assert!(!oniguruma.has_binaries);
        assert_eq!(oniguruma.size_bytes, 0);

        assert_eq!(
            inventory.dependencies,
            vec![DependencyEdge {
                package: "jq".to_string(),
                depends_on: "oniguruma".to_string(),
            }]
        );
    }

    #[test]
    fn detect_requires_brew_under_a_prefix() {
        let empty = tempfile::tempdir().expect("tempdir");
        let err = BrewCli::detect(&[empty.path().to_path_buf()]).expect_err("no brew");
        assert!(matches!(err, PackageManagerError::NotFound { .. }));

        fs::create_dir_all(empty.path().join("bin")).expect("bin");
        fs::write(empty.path().join("bin/brew"), "#!/bin/sh\n").expect("brew");
        let brew = BrewCli::detect(&[PathBuf::from("/nonexistent"), empty.path().to_path_buf()])
            .expect("detect");
        assert_eq!(brew.program, empty.path().join("bin/brew"));
        assert_eq!(brew.prefix, empty.path());
    }

    #[test]
    fn failing_brew_command_reports_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let brew = BrewCli::new("false", dir.path());
        let err = brew.list_installed().expect_err("false fails");
        assert!(matches!(err, PackageManagerError::Command { .. }));
    }
}
