use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{estimate_size, HistoryBackend, HistoryRecord, StorageEstimate, StoreError};

/// History persisted in a SQLite file. The quota is a configured byte budget
/// over the serialized size of stored records.
#[derive(Clone)]
pub struct SqliteHistory {
    db_path: PathBuf,
    quota_bytes: u64,
}

impl SqliteHistory {
    pub fn open(db_path: &Path, quota_bytes: u64) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite db at {}", db_path.display()))?;

        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS history (
  id INTEGER PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  payload_json TEXT NOT NULL
);
            "#,
        )
        .context("failed to init sqlite schema")?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            quota_bytes,
        })
    }

    async fn with_conn<T, F>(&self, what: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut conn = Connection::open(&db_path)?;
            f(&mut conn)
        })
        .await
        .with_context(|| format!("{what} task failed"))?
        .with_context(|| format!("{what} failed"))?;
        Ok(result)
    }
}

fn used_bytes(conn: &Connection, excluding_id: Option<i64>) -> rusqlite::Result<u64> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM history WHERE id IS NOT ?1",
        params![excluding_id],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
}

#[async_trait]
impl HistoryBackend for SqliteHistory {
    async fn put(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record).context("failed to serialize history record")?;
        let size = estimate_size(record);
        let quota = self.quota_bytes;
        let id = record.id;
        let created_at_ms = record.timestamp;
        let kind = serde_json::to_value(record.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let fitted = self
            .with_conn("history put", move |conn| {
                let tx = conn.transaction()?;
                if used_bytes(&tx, Some(id))? + size > quota {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT OR REPLACE INTO history (id, created_at_ms, kind, size_bytes, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, created_at_ms, kind, size as i64, payload],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if fitted {
            Ok(())
        } else {
            Err(StoreError::QuotaExceeded)
        }
    }

    async fn get_all(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        self.with_conn("history list", |conn| {
            let mut stmt = conn.prepare("SELECT payload_json FROM history ORDER BY id DESC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut records = Vec::new();
            for payload in rows {
                let payload = payload?;
                match serde_json::from_str::<HistoryRecord>(&payload) {
                    Ok(record) => records.push(record),
                    Err(err) => tracing::warn!(error = %err, "skipping undecodable history row"),
                }
            }
            Ok(records)
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn("history delete", move |conn| {
            Ok(conn.execute("DELETE FROM history WHERE id = ?1", params![id])? > 0)
        })
        .await
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        self.with_conn("history clear", |conn| Ok(conn.execute("DELETE FROM history", [])?))
            .await
    }

    async fn oldest_id(&self) -> Result<Option<i64>, StoreError> {
        self.with_conn("history oldest", |conn| {
            Ok(conn
                .query_row("SELECT id FROM history ORDER BY id ASC LIMIT 1", [], |row| row.get(0))
                .optional()?)
        })
        .await
    }

    async fn newest_id(&self) -> Result<Option<i64>, StoreError> {
        self.with_conn("history newest", |conn| {
            Ok(conn
                .query_row("SELECT MAX(id) FROM history", [], |row| row.get(0))?)
        })
        .await
    }

    async fn estimate(&self) -> Result<StorageEstimate, StoreError> {
        let quota = self.quota_bytes;
        self.with_conn("history estimate", move |conn| {
            Ok(StorageEstimate {
                used: used_bytes(conn, None)?,
                quota,
            })
        })
        .await
    }
}
