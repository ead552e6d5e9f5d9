//! Where the installed package set comes from.
//!
//! The scorer never talks to a package manager; `scan` copies a snapshot of
//! the inventory into the store and `remove` is the only caller of
//! [`PackageManager::uninstall`].

pub mod brew;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::model::{DependencyEdge, Package};

pub use brew::BrewCli;

#[derive(Debug, Error)]
pub enum PackageManagerError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program} {args} failed ({status}): {stderr}")]
    Command {
        program: PathBuf,
        args: String,
        status: String,
        stderr: String,
    },
    #[error("cannot parse inventory: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no package manager found under {searched}")]
    NotFound { searched: String },
    #[error("{0} does not support uninstall")]
    Unsupported(&'static str),
}

pub trait PackageManager {
    fn list_installed(&self) -> Result<Vec<Package>, PackageManagerError>;
    fn dependency_edges(&self) -> Result<Vec<DependencyEdge>, PackageManagerError>;
    fn uninstall(&self, name: &str) -> Result<(), PackageManagerError>;
}

/// Inventory snapshot stored as JSON, used by `scan --from` and in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFile {
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
}

impl InventoryFile {
    pub fn load(path: &Path) -> Result<Self, PackageManagerError> {
        let content = fs::read_to_string(path).map_err(|source| PackageManagerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl PackageManager for InventoryFile {
    fn list_installed(&self) -> Result<Vec<Package>, PackageManagerError> {
        Ok(self.packages.clone())
    }

    fn dependency_edges(&self) -> Result<Vec<DependencyEdge>, PackageManagerError> {
        Ok(self.dependencies.clone())
    }

    fn uninstall(&self, _name: &str) -> Result<(), PackageManagerError> {
        Err(PackageManagerError::Unsupported("inventory file"))
    }
}
