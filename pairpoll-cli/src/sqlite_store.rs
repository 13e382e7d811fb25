/// SQLite-backed `SharedMap`.
///
/// Every process opens its own connection to the same database file. SQLite's
/// file locking serializes writers across processes; lease acquisition runs in an
/// IMMEDIATE transaction so the expiry check and insert are one atomic step.
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::store::{LeaseToken, SharedMap, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fields (
    key   TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
CREATE TABLE IF NOT EXISTS leases (
    name          TEXT PRIMARY KEY,
    token         TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Private in-memory database; mostly useful in tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedMap for SqliteStore {
    fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO fields (key, field, value) VALUES (?1, ?2, ?3)",
            params![key, field, value],
        )?;
        Ok(changed == 1)
    }

    fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM fields WHERE key=?1 AND field=?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO fields (key, field, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(key, field) DO UPDATE SET value=excluded.value
            "#,
            params![key, field, value],
        )?;
        Ok(())
    }

    fn get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT field, value FROM fields WHERE key=?1 ORDER BY rowid")?;
        let rows = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(rows)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn().execute("DELETE FROM fields WHERE key=?1", params![key])?;
        Ok(())
    }

    fn try_acquire_lease(&self, name: &str, timeout: Duration) -> Result<Option<LeaseToken>, StoreError> {
        let now = now_ms();
        let ttl_ms = timeout.as_millis().min(i64::MAX as u128) as i64;
        let lease = LeaseToken::new(name);

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM leases WHERE name=?1 AND expires_at_ms <= ?2",
            params![name, now],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO leases (name, token, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![name, lease.token.to_string(), now.saturating_add(ttl_ms)],
        )?;
        tx.commit()?;

        Ok((inserted == 1).then_some(lease))
    }

    fn release_lease(&self, lease: &LeaseToken) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "DELETE FROM leases WHERE name=?1 AND token=?2",
            params![lease.name, lease.token.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn clear_leases(&self) -> Result<usize, StoreError> {
        Ok(self.conn().execute("DELETE FROM leases", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_roundtrip_in_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.set_if_absent("status:gpt", "q2", "a").unwrap());
        assert!(store.set_if_absent("status:gpt", "q1", "b").unwrap());
        assert!(!store.set_if_absent("status:gpt", "q1", "c").unwrap());

        store.set("status:gpt", "q2", "updated").unwrap();
        assert_eq!(
            store.get_all("status:gpt").unwrap(),
            vec![
                ("q2".to_string(), "updated".to_string()),
                ("q1".to_string(), "b".to_string()),
            ]
        );
        assert!(store.get_all("status:other").unwrap().is_empty());

        store.delete("status:gpt").unwrap();
        assert!(store.get("status:gpt", "q1").unwrap().is_none());
    }

    #[test]
    fn test_leases_are_shared_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.sqlite3");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        let lease = first.try_acquire_lease("lock:m:q", Duration::from_secs(10)).unwrap().unwrap();
        assert!(second.try_acquire_lease("lock:m:q", Duration::from_secs(10)).unwrap().is_none());

        assert!(first.release_lease(&lease).unwrap());
        assert!(second.try_acquire_lease("lock:m:q", Duration::from_secs(10)).unwrap().is_some());
        assert_eq!(first.clear_leases().unwrap(), 1);
    }

    #[test]
    fn test_expired_lease_is_replaced() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stale = store.try_acquire_lease("lock:m:q", Duration::from_millis(0)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let fresh = store.try_acquire_lease("lock:m:q", Duration::from_secs(10)).unwrap().unwrap();

        assert!(!store.release_lease(&stale).unwrap());
        assert!(store.release_lease(&fresh).unwrap());
    }

    #[test]
    fn test_fields_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.sqlite3");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("status:gpt", "q", "v").unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("status:gpt", "q").unwrap().as_deref(), Some("v"));
    }
}
