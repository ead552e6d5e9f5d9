pub mod checkpoint;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::ingest::checkpoint::Checkpoint;
use crate::resolver::BinaryMap;
use crate::store::UsageStore;
use crate::store::model::{EventKind, UsageEvent, classify_binary};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read usage log `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to load package inventory: {0}")]
    Inventory(#[source] rusqlite::Error),
    #[error(
        "commit of {events} events from `{path}` (bytes {start}..{end}) failed, checkpoint left at {start}: {source}"
    )]
    Commit {
        path: PathBuf,
        start: u64,
        end: u64,
        events: usize,
        source: rusqlite::Error,
    },
    #[error("events committed but checkpoint `{path}` could not be advanced to {offset}: {source}")]
    Checkpoint {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedLine {
    #[error("missing `,` separator")]
    MissingSeparator,
    #[error("timestamp is not an integer")]
    BadTimestamp,
    #[error("timestamp is not positive")]
    NonPositiveTimestamp,
    #[error("empty binary path")]
    EmptyPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub path: String,
}

/// `<unix-nanos>,<path>` without the trailing newline.
pub fn parse_line(line: &str) -> Result<LogEntry, MalformedLine> {
    let (raw_ts, path) = line.split_once(',').ok_or(MalformedLine::MissingSeparator)?;
    let nanos: i64 = raw_ts
        .trim()
        .parse()
        .map_err(|_| MalformedLine::BadTimestamp)?;
    if nanos <= 0 {
        return Err(MalformedLine::NonPositiveTimestamp);
    }
    let path = path.trim();
    if path.is_empty() {
        return Err(MalformedLine::EmptyPath);
    }
    Ok(LogEntry {
        timestamp: DateTime::from_timestamp_nanos(nanos),
        path: path.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub log_missing: bool,
    pub start_offset: u64,
    pub end_offset: u64,
    pub offset_reset: bool,
    pub lines_scanned: usize,
    pub hit_line_cap: bool,
    pub events_resolved: usize,
    pub events_inserted: usize,
    pub probe_events: usize,
    pub unresolved: usize,
    pub malformed: usize,
}

/// One tick of usage-log ingestion. Holds only configuration; every call
/// reloads the checkpoint and the package inventory.
#[derive(Debug, Clone)]
pub struct LogProcessor {
    usage_log: PathBuf,
    checkpoint: Checkpoint,
    prefixes: Vec<PathBuf>,
    probe_suffix: String,
    max_lines: usize,
}

impl LogProcessor {
    pub fn new(
        usage_log: impl Into<PathBuf>,
        checkpoint: impl Into<PathBuf>,
        prefixes: Vec<PathBuf>,
        probe_suffix: impl Into<String>,
        max_lines: usize,
    ) -> Self {
        Self {
            usage_log: usage_log.into(),
            checkpoint: Checkpoint::new(checkpoint),
            prefixes,
            probe_suffix: probe_suffix.into(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.usage_log.clone(),
            settings.checkpoint.clone(),
            settings.prefixes.clone(),
            settings.probe_suffix.clone(),
            settings.max_lines_per_tick,
        )
    }

    pub fn usage_log(&self) -> &Path {
        &self.usage_log
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn process<S: UsageStore + ?Sized>(&self, store: &S) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::default();

        let file = match File::open(&self.usage_log) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.usage_log.display(), "usage log not created yet");
                report.log_missing = true;
                return Ok(report);
            }
            Err(source) => return Err(self.read_error(source)),
        };
        let len = file
            .metadata()
            .map_err(|source| self.read_error(source))?
            .len();

        let saved = self.checkpoint.load();
        let mut start = saved;
        if start > len {
            warn!(
                checkpoint = start,
                log_len = len,
                "usage log shrank below checkpoint (rotated or truncated), rescanning from start"
            );
            start = 0;
            report.offset_reset = true;
        }

        let mut reader = BufReader::new(file);
        if let Err(err) = reader.seek(SeekFrom::Start(start)) {
            warn!(checkpoint = start, error = %err, "seek to checkpoint failed, rescanning from start");
            reader
                .seek(SeekFrom::Start(0))
                .map_err(|source| self.read_error(source))?;
            start = 0;
            report.offset_reset = true;
        }
        report.start_offset = start;

        let packages = store.list_packages().map_err(IngestError::Inventory)?;
        let map = BinaryMap::build(&packages);
        debug!(
            packages = packages.len(),
            paths = map.path_count(),
            names = map.name_count(),
            "binary map built"
        );

        let mut events = Vec::new();
        let mut consumed = 0u64;
        let mut buf = Vec::new();
        while report.lines_scanned < self.max_lines {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| self.read_error(source))?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                // An append still in flight; pick it up next tick.
                debug!(bytes = read, "partial trailing line left for next tick");
                break;
            }
            let line_offset = start + consumed;
            consumed += read as u64;
            report.lines_scanned += 1;

            let text = String::from_utf8_lossy(&buf[..read - 1]);
            let entry = match parse_line(text.trim_end_matches('\r')) {
                Ok(entry) => entry,
                Err(reason) => {
                    warn!(offset = line_offset, %reason, "skipping malformed usage log line");
                    report.malformed += 1;
                    continue;
                }
            };

            let Some(package) = map.resolve(&entry.path, &self.prefixes) else {
                debug!(path = %entry.path, "no package owns binary");
                report.unresolved += 1;
                continue;
            };

            let kind = classify_binary(&entry.path, &self.probe_suffix);
            if kind == EventKind::Probe {
                report.probe_events += 1;
            }
            events.push(UsageEvent {
                package: package.to_string(),
                kind,
                binary_path: entry.path,
                timestamp: entry.timestamp,
            });
        }
        report.hit_line_cap = report.lines_scanned >= self.max_lines;
        report.events_resolved = events.len();
        report.end_offset = start + consumed;

        if !events.is_empty() {
            report.events_inserted = store
                .insert_usage_events_batch(&events)
                .map_err(|source| IngestError::Commit {
                    path: self.usage_log.clone(),
                    start,
                    end: report.end_offset,
                    events: events.len(),
                    source,
                })?;
        }

        if report.end_offset != saved {
            self.checkpoint
                .store(report.end_offset)
                .map_err(|source| IngestError::Checkpoint {
                    path: self.checkpoint.path().to_path_buf(),
                    offset: report.end_offset,
                    source,
                })?;
        }

        if report.lines_scanned > 0 {
            info!(
                start = report.start_offset,
                end = report.end_offset,
                lines = report.lines_scanned,
                inserted = report.events_inserted,
                probes = report.probe_events,
                unresolved = report.unresolved,
                malformed = report.malformed,
                "ingested usage log"
            );
        }
        Ok(report)
    }

    fn read_error(&self, source: io::Error) -> IngestError {
        IngestError::Read {
            path: self.usage_log.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::store::model::{InstallReason, Package};
    use chrono::TimeZone;
    use std::fs::{self, OpenOptions};
    use std::io::Write;

    const TS: i64 = 1_771_761_600_000_000_000;

    fn package(name: &str, binaries: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            installed_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            reason: InstallReason::Explicit,
            has_binaries: !binaries.is_empty(),
            binaries: binaries.iter().map(|b| b.to_string()).collect(),
            size_bytes: 0,
        }
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("sqlite");
        store
            .replace_inventory(
                &[
                    package("jq", &["/opt/homebrew/bin/jq"]),
                    package("pkgconf", &["/opt/homebrew/bin/pkg-config"]),
                ],
                &[],
            )
            .expect("inventory");
        store
    }

    fn processor(dir: &Path, max_lines: usize) -> LogProcessor {
        LogProcessor::new(
            dir.join("usage.log"),
            dir.join("usage.offset"),
            vec![PathBuf::from("/opt/homebrew")],
            "-config",
            max_lines,
        )
    }

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        file.write_all(content.as_bytes()).expect("append");
    }

    fn line(offset_secs: i64, path: &str) -> String {
        format!("{},{path}\n", TS + offset_secs * 1_000_000_000)
    }

    struct RejectingStore {
        inner: SqliteStore,
    }

    impl UsageStore for RejectingStore {
        fn insert_usage_events_batch(&self, _events: &[UsageEvent]) -> rusqlite::Result<usize> {
            Err(rusqlite::Error::InvalidQuery)
        }
        fn list_packages(&self) -> rusqlite::Result<Vec<Package>> {
            self.inner.list_packages()
        }
        fn get_package(&self, name: &str) -> rusqlite::Result<Option<Package>> {
            self.inner.get_package(name)
        }
        fn get_dependents(&self, name: &str) -> rusqlite::Result<Vec<String>> {
            self.inner.get_dependents(name)
        }
        fn get_dependencies(&self, name: &str) -> rusqlite::Result<Vec<String>> {
            self.inner.get_dependencies(name)
        }
        fn get_last_usage(&self, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
            self.inner.get_last_usage(name)
        }
        fn get_usage_event_count_since(
            &self,
            name: &str,
            since: DateTime<Utc>,
        ) -> rusqlite::Result<u64> {
            self.inner.get_usage_event_count_since(name, since)
        }
    }

    #[test]
    fn parses_well_formed_lines() {
        let entry = parse_line("1771761600000000000,/opt/homebrew/bin/jq").expect("parse");
        assert_eq!(entry.path, "/opt/homebrew/bin/jq");
        assert_eq!(entry.timestamp.timestamp(), 1_771_761_600);
    }

    #[test]
    fn rejects_each_malformed_shape() {
        assert_eq!(parse_line("no separator"), Err(MalformedLine::MissingSeparator));
        assert_eq!(parse_line("abc,/bin/jq"), Err(MalformedLine::BadTimestamp));
        assert_eq!(parse_line("0,/bin/jq"), Err(MalformedLine::NonPositiveTimestamp));
        assert_eq!(parse_line("-5,/bin/jq"), Err(MalformedLine::NonPositiveTimestamp));
        assert_eq!(parse_line("12, "), Err(MalformedLine::EmptyPath));
    }

    #[test]
    fn missing_log_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = processor(dir.path(), 100).process(&store()).expect("tick");
        assert!(report.log_missing);
        assert!(!dir.path().join("usage.offset").exists());
    }

    #[test]
    fn ingests_resolves_and_classifies_then_advances_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        let content = [
            line(0, "/home/me/.pruneguard/bin/jq"),
            line(1, "/home/me/.pruneguard/bin/pkg-config"),
            line(2, "/home/me/.pruneguard/bin/uninstalled"),
            "garbage line\n".to_string(),
        ]
        .concat();
        append(&log, &content);
        let store = store();

        let report = processor(dir.path(), 100).process(&store).expect("tick");
        assert_eq!(report.lines_scanned, 4);
        assert_eq!(report.events_inserted, 2);
        assert_eq!(report.probe_events, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.end_offset, content.len() as u64);
        assert_eq!(
            fs::read_to_string(dir.path().join("usage.offset")).expect("checkpoint"),
            content.len().to_string()
        );

        let jq = store.usage_events_for("jq").expect("jq events");
        assert_eq!(jq.len(), 1);
        assert_eq!(jq[0].kind, EventKind::Exec);
        let probes = store.usage_events_for("pkgconf").expect("pkgconf events");
        assert_eq!(probes[0].kind, EventKind::Probe);
        assert_eq!(store.get_last_usage("pkgconf").expect("last"), None);
    }

    #[test]
    fn checkpoint_is_monotonic_and_nothing_is_reingested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        let store = store();
        let processor = processor(dir.path(), 100);

        let mut last_offset = 0;
        for round in 0..3 {
            append(&log, &line(round, "/opt/homebrew/bin/jq"));
            let report = processor.process(&store).expect("tick");
            assert_eq!(report.start_offset, last_offset);
            assert!(report.end_offset > last_offset);
            assert_eq!(report.lines_scanned, 1);
            last_offset = report.end_offset;
        }

        let idle = processor.process(&store).expect("idle tick");
        assert_eq!(idle.lines_scanned, 0);
        assert_eq!(idle.end_offset, last_offset);
        assert_eq!(store.usage_events_for("jq").expect("events").len(), 3);
    }

    #[test]
    fn line_cap_bounds_each_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        for i in 0..5 {
            append(&log, &line(i, "/opt/homebrew/bin/jq"));
        }
        let store = store();
        let processor = processor(dir.path(), 2);

        let first = processor.process(&store).expect("first");
        assert_eq!(first.lines_scanned, 2);
        assert!(first.hit_line_cap);
        let second = processor.process(&store).expect("second");
        assert_eq!(second.start_offset, first.end_offset);
        let third = processor.process(&store).expect("third");
        assert_eq!(third.lines_scanned, 1);
        assert!(!third.hit_line_cap);
        assert_eq!(store.usage_events_for("jq").expect("events").len(), 5);
    }

    #[test]
    fn truncated_log_rescans_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        let store = store();
        let processor = processor(dir.path(), 100);

        append(&log, &[line(0, "/opt/homebrew/bin/jq"), line(1, "/opt/homebrew/bin/jq")].concat());
        processor.process(&store).expect("first tick");

        fs::write(&log, line(60, "/opt/homebrew/bin/jq")).expect("rotate");
        let report = processor.process(&store).expect("after rotation");
        assert!(report.offset_reset);
        assert_eq!(report.start_offset, 0);
        assert_eq!(report.events_inserted, 1);
        assert_eq!(processor.checkpoint().load(), report.end_offset);
    }

    #[test]
    fn partial_trailing_line_waits_for_next_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        let store = store();
        let processor = processor(dir.path(), 100);
        let complete = line(0, "/opt/homebrew/bin/jq");

        let later = TS + 1_000_000_000;
        append(&log, &format!("{complete}{later},/opt/homebrew/bin/j"));
        let first = processor.process(&store).expect("first");
        assert_eq!(first.lines_scanned, 1);
        assert_eq!(first.end_offset, complete.len() as u64);

        append(&log, "q\n");
        let second = processor.process(&store).expect("second");
        assert_eq!(second.lines_scanned, 1);
        assert_eq!(second.events_inserted, 1);
        assert_eq!(second.start_offset, complete.len() as u64);
        assert_eq!(store.usage_events_for("jq").expect("events").len(), 2);
    }

    #[test]
    fn unresolvable_lines_still_advance_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        let content = [line(0, "/x/bin/ghost"), "bad\n".to_string()].concat();
        append(&log, &content);

        let report = processor(dir.path(), 100).process(&store()).expect("tick");
        assert_eq!(report.events_resolved, 0);
        assert_eq!(report.end_offset, content.len() as u64);
        assert_eq!(
            processor(dir.path(), 100).checkpoint().load(),
            content.len() as u64
        );
    }

    #[test]
    fn failed_commit_leaves_checkpoint_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        append(&log, &line(0, "/opt/homebrew/bin/jq"));
        let processor = processor(dir.path(), 100);
        processor.checkpoint().store(0).expect("seed checkpoint");

        let err = processor
            .process(&RejectingStore { inner: store() })
            .expect_err("commit fails");
        assert!(matches!(err, IngestError::Commit { start: 0, events: 1, .. }));
        assert_eq!(processor.checkpoint().load(), 0);
    }

    #[test]
    fn rerun_after_crash_before_checkpoint_rename_reproduces_same_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("usage.log");
        append(&log, &[line(0, "/opt/homebrew/bin/jq"), line(5, "/opt/homebrew/bin/jq")].concat());
        let store = store();
        let processor = processor(dir.path(), 100);

        let first = processor.process(&store).expect("first");
        assert_eq!(first.events_inserted, 2);
        let before = store.usage_events_for("jq").expect("events");

        // Commit happened, rename did not.
        processor.checkpoint().store(0).expect("rewind");
        let second = processor.process(&store).expect("replay");
        assert_eq!(second.events_resolved, 2);
        assert_eq!(second.events_inserted, 0);
        assert_eq!(store.usage_events_for("jq").expect("events"), before);
        assert_eq!(processor.checkpoint().load(), first.end_offset);
    }
}
