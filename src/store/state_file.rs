use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Small single-value file under the state directory (the ingest offset,
/// the daemon PID). Readers only ever see a complete value: `replace` goes
/// through a sibling temp file and a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `None` when the file does not exist.
    pub fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Durably swaps in `contents`, creating the state directory if needed.
    pub fn replace(&self, contents: &str) -> io::Result<()> {
        let (dir, name) = self.split()?;
        fs::create_dir_all(dir)?;
        let staged = dir.join(format!(".{name}.{}.tmp", std::process::id()));

        let result = write_synced(&staged, contents.as_bytes())
            .and_then(|()| fs::rename(&staged, &self.path))
            .and_then(|()| sync_dir(dir));
        if result.is_err() {
            let _ = fs::remove_file(&staged);
        }
        result
    }

    /// Returns whether a file was actually deleted.
    pub fn remove(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn split(&self) -> io::Result<(&Path, String)> {
        let dir = self.path.parent().filter(|dir| !dir.as_os_str().is_empty());
        let name = self.path.file_name().map(|name| name.to_string_lossy());
        match (dir, name) {
            (Some(dir), Some(name)) => Ok((dir, name.into_owned())),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("state file path `{}` needs a directory and a name", self.path.display()),
            )),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_none_and_removes_as_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = StateFile::new(dir.path().join("usage.offset"));
        assert_eq!(file.read().expect("read"), None);
        assert!(!file.remove().expect("remove"));
    }

    #[test]
    fn replace_creates_the_state_dir_and_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = StateFile::new(dir.path().join(".pruneguard").join("watch.pid"));

        file.replace("100\n").expect("first");
        file.replace("200\n").expect("second");
        assert_eq!(file.read().expect("read").as_deref(), Some("200\n"));

        let names: Vec<String> = fs::read_dir(dir.path().join(".pruneguard"))
            .expect("list")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["watch.pid".to_string()]);

        assert!(file.remove().expect("remove"));
        assert!(!file.exists());
    }

    #[test]
    fn bare_root_is_rejected() {
        let err = StateFile::new("/").replace("x").expect_err("no name");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
