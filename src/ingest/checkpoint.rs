use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::store::state_file::StateFile;

/// Byte offset into the usage log up to which events are durably stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    file: StateFile,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: StateFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Missing file means nothing ingested yet. An unreadable or garbled file
    /// is reported and treated as offset 0; the store deduplicates whatever
    /// gets rescanned.
    pub fn load(&self) -> u64 {
        let raw = match self.file.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(err) => {
                warn!(path = %self.path().display(), error = %err, "checkpoint unreadable, rescanning from start");
                return 0;
            }
        };
        match raw.trim().parse::<u64>() {
            Ok(offset) => offset,
            Err(err) => {
                warn!(path = %self.path().display(), error = %err, "checkpoint is not a byte offset, rescanning from start");
                0
            }
        }
    }

    pub fn store(&self, offset: u64) -> io::Result<()> {
        self.file.replace(&offset.to_string())
    }
}
