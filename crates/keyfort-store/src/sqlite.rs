//! Sqlite-backed store
//!
//! One table per store kind plus an integer-keyed `audit` table. The
//! background context is single-threaded-cooperative, so a single
//! connection behind an async mutex is enough; a busy timeout absorbs
//! transient locking from external readers.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::{SideWrite, Store, StoreKind};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::init(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS keys (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS leases (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS audit (seq INTEGER PRIMARY KEY, value TEXT NOT NULL);",
        )
        .map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode(text: String) -> Result<Value> {
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, store: StoreKind, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", store.table()),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        text.map(decode).transpose()
    }

    async fn put(&self, store: StoreKind, key: &str, value: Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                store.table()
            ),
            params![key, encode(&value)?],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, store: StoreKind, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", store.table()),
            params![key],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self, store: StoreKind) -> Result<Vec<(String, Value)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT key, value FROM {} ORDER BY key",
                store.table()
            ))
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?;

        let mut records = Vec::new();
        for row in rows {
            let (key, text) = row.map_err(unavailable)?;
            records.push((key, decode(text)?));
        }
        Ok(records)
    }

    async fn audit_tail(&self) -> Result<Option<(u64, Value)>> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT seq, value FROM audit ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(unavailable)?;
        row.map(|(seq, text)| Ok((seq as u64, decode(text)?)))
            .transpose()
    }

    async fn audit_get(&self, seq: u64) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM audit WHERE seq = ?1",
                params![seq as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        text.map(decode).transpose()
    }

    async fn audit_range(&self, from: u64, to: Option<u64>) -> Result<Vec<(u64, Value)>> {
        let conn = self.conn.lock().await;
        let upper = to.map(|t| t as i64).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare("SELECT seq, value FROM audit WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![from as i64, upper], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, text) = row.map_err(unavailable)?;
            entries.push((seq as u64, decode(text)?));
        }
        Ok(entries)
    }

    async fn append_audit(
        &self,
        expected_seq: u64,
        entry: Value,
        writes: Vec<SideWrite>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let tail: i64 = tx
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM audit", [], |row| {
                row.get(0)
            })
            .map_err(unavailable)?;
        if expected_seq != tail as u64 + 1 {
            return Err(StoreError::AppendConflict {
                expected: expected_seq,
                tail: tail as u64,
            });
        }

        tx.execute(
            "INSERT INTO audit (seq, value) VALUES (?1, ?2)",
            params![expected_seq as i64, encode(&entry)?],
        )
        .map_err(unavailable)?;

        for write in &writes {
            match write {
                SideWrite::Put { store, key, value } => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (key, value) VALUES (?1, ?2)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                            store.table()
                        ),
                        params![key, encode(value)?],
                    )
                    .map_err(unavailable)?;
                }
                SideWrite::Delete { store, key } => {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE key = ?1", store.table()),
                        params![key],
                    )
                    .map_err(unavailable)?;
                }
            }
        }

        tx.commit().map_err(unavailable)?;
        debug!(seq = expected_seq, writes = writes.len(), "audit appended");
        Ok(())
    }

    async fn audit_put(&self, seq: u64, entry: Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit (seq, value) VALUES (?1, ?2)
             ON CONFLICT(seq) DO UPDATE SET value = excluded.value",
            params![seq as i64, encode(&entry)?],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn audit_delete(&self, seq: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM audit WHERE seq = ?1", params![seq as i64])
            .map_err(unavailable)?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "DELETE FROM meta; DELETE FROM keys; DELETE FROM leases; DELETE FROM audit;",
        )
        .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kf.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put(StoreKind::Keys, "kid", json!({"alg": "ES256"}))
                .await
                .unwrap();
            store
                .append_audit(1, json!({"op": "init"}), vec![])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(StoreKind::Keys, "kid").await.unwrap().is_some());
        let (seq, _) = store.audit_tail().await.unwrap().unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn append_is_atomic_with_side_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_audit(
                1,
                json!({"op": "setup"}),
                vec![SideWrite::Put {
                    store: StoreKind::Meta,
                    key: "enrollment:passphrase:u".into(),
                    value: json!({"method": "passphrase"}),
                }],
            )
            .await
            .unwrap();

        // A conflicting append must leave no trace of its side writes.
        let err = store
            .append_audit(
                1,
                json!({"op": "dup"}),
                vec![SideWrite::Put {
                    store: StoreKind::Meta,
                    key: "should-not-exist".into(),
                    value: json!(1),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AppendConflict { .. }));
        assert!(store
            .get(StoreKind::Meta, "should-not-exist")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn range_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        for seq in 1..=5 {
            store
                .append_audit(seq, json!({ "seq": seq }), vec![])
                .await
                .unwrap();
        }

        let mid = store.audit_range(2, Some(4)).await.unwrap();
        assert_eq!(mid.iter().map(|(s, _)| *s).collect::<Vec<_>>(), [2, 3, 4]);

        store.audit_delete(3).await.unwrap();
        let all = store.audit_range(1, None).await.unwrap();
        assert_eq!(
            all.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            [1, 2, 4, 5]
        );
    }
}
