use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::info;

use crate::errors::AppResult;

/// One persisted cache entry, still in its stored textual form.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub rm: String,
    pub address: String,
    pub parsed_json: String,
    pub history: String,
    pub resolved_at: String,
}

/// External persistence for the resolution cache. The cache writes through on every update.
pub trait HistoryStore: Send + Sync {
    fn save(&self, record: &StoredRecord) -> AppResult<()>;
    fn load(&self, rm: &str, address: &str) -> AppResult<Option<StoredRecord>>;
    fn load_all(&self) -> AppResult<Vec<StoredRecord>>;
}

pub struct SqliteHistoryStore {
    connection: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteHistoryStore {
    pub fn open<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(database_file);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(&db_path, flags)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        run_migrations(&connection)?;
        info!(
            target: "history_store",
            path = %db_path.display(),
            "resolution history store ready"
        );
        Ok(Self {
            connection: Mutex::new(connection),
            path: Some(db_path),
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn save(&self, record: &StoredRecord) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO resolution_cache (rm, address, parsed_json, history, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(rm, address) DO UPDATE SET
                parsed_json = excluded.parsed_json,
                history = excluded.history,
                resolved_at = excluded.resolved_at",
            (
                record.rm.as_str(),
                record.address.as_str(),
                record.parsed_json.as_str(),
                record.history.as_str(),
                record.resolved_at.as_str(),
            ),
        )?;
        Ok(())
    }

    fn load(&self, rm: &str, address: &str) -> AppResult<Option<StoredRecord>> {
        let conn = self.connection.lock();
        let record = conn
            .query_row(
                "SELECT rm, address, parsed_json, history, resolved_at
                FROM resolution_cache
                WHERE rm = ?1 AND address = ?2",
                (rm, address),
                parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn load_all(&self) -> AppResult<Vec<StoredRecord>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT rm, address, parsed_json, history, resolved_at
            FROM resolution_cache
            ORDER BY rm, address",
        )?;
        let rows = stmt
            .query_map([], parse_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        rm: row.get(0)?,
        address: row.get(1)?,
        parsed_json: row.get(2)?,
        history: row.get(3)?,
        resolved_at: row.get(4)?,
    })
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS resolution_cache (
            rm TEXT NOT NULL,
            address TEXT NOT NULL,
            parsed_json TEXT NOT NULL,
            history TEXT NOT NULL DEFAULT '',
            resolved_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%SZ', 'now')),
            PRIMARY KEY (rm, address)
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(history: &str) -> StoredRecord {
        StoredRecord {
            rm: "ivanov".into(),
            address: "г. казань".into(),
            parsed_json: "{}".into(),
            history: history.into(),
            resolved_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn upserts_by_key() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        store.save(&record("a")).unwrap();
        store.save(&record("a||b")).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].history, "a||b");
        assert!(store.load("ivanov", "missing").unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SqliteHistoryStore::open(dir.path(), "cache.db").unwrap();
            store.save(&record("Казань")).unwrap();
            assert!(store.path().is_some());
        }
        let store = SqliteHistoryStore::open(dir.path(), "cache.db").unwrap();
        let loaded = store.load("ivanov", "г. казань").unwrap().unwrap();
        assert_eq!(loaded.history, "Казань");
    }
}
