pub mod model;
pub mod state_file;

use std::collections::HashSet;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::store::model::{
    DependencyEdge, EventKind, Package, UsageEvent, decode_event_kind, decode_install_reason,
    encode_event_kind, encode_install_reason,
};

/// Read/write contract the ingest pipeline and the scorer depend on.
///
/// Usage queries (`get_last_usage`, `get_usage_event_count_since`) never
/// count probe events.
pub trait UsageStore {
    /// Inserts every event in one transaction. Either all rows are applied or
    /// none are. Returns the number of rows that were new.
    fn insert_usage_events_batch(&self, events: &[UsageEvent]) -> rusqlite::Result<usize>;
    fn list_packages(&self) -> rusqlite::Result<Vec<Package>>;
    fn get_package(&self, name: &str) -> rusqlite::Result<Option<Package>>;
    fn get_dependents(&self, name: &str) -> rusqlite::Result<Vec<String>>;
    fn get_dependencies(&self, name: &str) -> rusqlite::Result<Vec<String>>;
    fn get_last_usage(&self, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>>;
    fn get_usage_event_count_since(
        &self,
        name: &str,
        since: DateTime<Utc>,
    ) -> rusqlite::Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventorySummary {
    pub upserted: usize,
    pub removed: usize,
    pub edges: usize,
    pub skipped_edges: usize,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn.execute_batch("PRAGMA user_version = 1;")?;
            }
            1 => self.create_schema_v1()?,
            _ => return Err(rusqlite::Error::InvalidQuery),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS packages (
                name TEXT PRIMARY KEY NOT NULL,
                installed_at INTEGER NOT NULL,
                reason TEXT NOT NULL CHECK (reason IN ('explicit', 'dependency')),
                has_binaries INTEGER NOT NULL CHECK (has_binaries IN (0, 1)),
                binaries TEXT NOT NULL DEFAULT '[]',
                size_bytes INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS dependencies (
                package TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE,
                depends_on TEXT NOT NULL,
                UNIQUE(package, depends_on)
            );

            CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON dependencies(depends_on);

            CREATE TABLE IF NOT EXISTS usage_events (
                package TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE,
                kind TEXT NOT NULL CHECK (kind IN ('exec', 'probe')),
                binary_path TEXT NOT NULL,
                timestamp_ns INTEGER NOT NULL,
                UNIQUE(package, binary_path, timestamp_ns, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_usage_events_package_time
                ON usage_events(package, kind, timestamp_ns);
            ",
        )?;
        Ok(())
    }

    /// Replaces the whole inventory in one transaction. Packages missing from
    /// `packages` are deleted together with their usage history; surviving
    /// rows are updated in place so their events are kept.
    pub fn replace_inventory(
        &self,
        packages: &[Package],
        edges: &[DependencyEdge],
    ) -> rusqlite::Result<InventorySummary> {
        let tx = self.conn.unchecked_transaction()?;
        let mut summary = InventorySummary::default();

        let incoming: HashSet<&str> = packages.iter().map(|pkg| pkg.name.as_str()).collect();
        let existing = Self::package_names_on(tx.deref())?;
        for name in existing.iter().filter(|name| !incoming.contains(name.as_str())) {
            tx.execute("DELETE FROM packages WHERE name = ?1", params![name])?;
            summary.removed += 1;
        }

        for package in packages {
            Self::upsert_package_on(tx.deref(), package)?;
            summary.upserted += 1;
        }

        tx.execute("DELETE FROM dependencies", [])?;
        for edge in edges {
            if !incoming.contains(edge.package.as_str()) {
                summary.skipped_edges += 1;
                continue;
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO dependencies (package, depends_on) VALUES (?1, ?2)",
                params![edge.package, edge.depends_on],
            )?;
            summary.edges += inserted;
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Drops one package after it was uninstalled. Its edges and usage
    /// history go with it.
    pub fn remove_package(&self, name: &str) -> rusqlite::Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM dependencies WHERE depends_on = ?1",
            params![name],
        )?;
        let removed = tx.execute("DELETE FROM packages WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn package_names_on(conn: &Connection) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT name FROM packages ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect()
    }

    fn upsert_package_on(conn: &Connection, package: &Package) -> rusqlite::Result<()> {
        Self::validate_name(&package.name)?;
        let binaries = serde_json::to_string(&package.binaries)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        conn.execute(
            "INSERT INTO packages (name, installed_at, reason, has_binaries, binaries, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                installed_at = excluded.installed_at,
                reason = excluded.reason,
                has_binaries = excluded.has_binaries,
                binaries = excluded.binaries,
                size_bytes = excluded.size_bytes",
            params![
                package.name,
                package.installed_at.timestamp(),
                encode_install_reason(package.reason),
                if package.has_binaries { 1_i64 } else { 0_i64 },
                binaries,
                i64::try_from(package.size_bytes).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(())
    }

    fn insert_usage_event_on(conn: &Connection, event: &UsageEvent) -> rusqlite::Result<usize> {
        Self::validate_name(&event.package)?;
        let timestamp_ns = Self::encode_timestamp(event.timestamp)?;
        conn.execute(
            "INSERT OR IGNORE INTO usage_events (package, kind, binary_path, timestamp_ns)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.package,
                encode_event_kind(event.kind),
                event.binary_path,
                timestamp_ns
            ],
        )
    }

    /// Full audit trail for one package, probes included, oldest first.
    pub fn usage_events_for(&self, name: &str) -> rusqlite::Result<Vec<UsageEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT package, kind, binary_path, timestamp_ns
             FROM usage_events
             WHERE package = ?1
             ORDER BY timestamp_ns ASC, binary_path ASC",
        )?;

        let mut rows = stmt.query(params![name])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(UsageEvent {
                package: row.get(0)?,
                kind: decode_event_kind(&row.get::<_, String>(1)?),
                binary_path: row.get(2)?,
                timestamp: DateTime::from_timestamp_nanos(row.get(3)?),
            });
        }
        Ok(out)
    }

    pub fn probe_count(&self, name: &str) -> rusqlite::Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM usage_events WHERE package = ?1 AND kind = ?2",
            params![name, encode_event_kind(EventKind::Probe)],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn package_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Package> {
        let binaries: String = row.get(4)?;
        let binaries: Vec<String> = serde_json::from_str(&binaries).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
        })?;
        let installed_at: i64 = row.get(1)?;
        Ok(Package {
            name: row.get(0)?,
            installed_at: DateTime::from_timestamp(installed_at, 0).unwrap_or_default(),
            reason: decode_install_reason(&row.get::<_, String>(2)?),
            has_binaries: row.get::<_, i64>(3)? != 0,
            binaries,
            size_bytes: u64::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
        })
    }
}

impl UsageStore for SqliteStore {
    fn insert_usage_events_batch(&self, events: &[UsageEvent]) -> rusqlite::Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0usize;
        for event in events {
            inserted += Self::insert_usage_event_on(tx.deref(), event)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn list_packages(&self) -> rusqlite::Result<Vec<Package>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, installed_at, reason, has_binaries, binaries, size_bytes
             FROM packages
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], Self::package_from_row)?;
        rows.collect()
    }

    fn get_package(&self, name: &str) -> rusqlite::Result<Option<Package>> {
        self.conn
            .query_row(
                "SELECT name, installed_at, reason, has_binaries, binaries, size_bytes
                 FROM packages
                 WHERE name = ?1",
                params![name],
                Self::package_from_row,
            )
            .optional()
    }

    fn get_dependents(&self, name: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT package FROM dependencies WHERE depends_on = ?1 ORDER BY package ASC",
        )?;
        let rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
        rows.collect()
    }

    fn get_dependencies(&self, name: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT depends_on FROM dependencies WHERE package = ?1 ORDER BY depends_on ASC",
        )?;
        let rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
        rows.collect()
    }

    fn get_last_usage(&self, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let last: Option<i64> = self.conn.query_row(
            "SELECT MAX(timestamp_ns) FROM usage_events WHERE package = ?1 AND kind = ?2",
            params![name, encode_event_kind(EventKind::Exec)],
            |row| row.get(0),
        )?;
        Ok(last.map(DateTime::from_timestamp_nanos))
    }

    fn get_usage_event_count_since(
        &self,
        name: &str,
        since: DateTime<Utc>,
    ) -> rusqlite::Result<u64> {
        let since_ns = Self::encode_timestamp(since)?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM usage_events
             WHERE package = ?1 AND kind = ?2 AND timestamp_ns >= ?3",
            params![name, encode_event_kind(EventKind::Exec), since_ns],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl SqliteStore {
    fn validate_name(name: &str) -> rusqlite::Result<()> {
        if name.is_empty() {
            return Err(rusqlite::Error::InvalidParameterName(
                "package name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn encode_timestamp(timestamp: DateTime<Utc>) -> rusqlite::Result<i64> {
        timestamp.timestamp_nanos_opt().ok_or_else(|| {
            rusqlite::Error::InvalidParameterName(format!(
                "timestamp {timestamp} is outside the nanosecond range"
            ))
        })
    }
}
