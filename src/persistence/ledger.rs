//! 断点续传记录库（SQLite）
//!
//! 所有上传任务共享同一个数据库连接，内部加锁，可并发调用。
//! 过期记录在打开时批量清理，读取时遇到过期记录也会顺带删除。

use std::path::{Path, PathBuf};
use std::time::Duration;

use bit_set::BitSet;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::LedgerRecord;

/// 续传记录库错误
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("续传记录库已关闭")]
    Closed,
    #[error("数据库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("记录序列化失败: {0}")]
    Json(#[from] serde_json::Error),
    #[error("创建数据库目录失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("记录数据无效: {0}")]
    Corrupted(String),
}

/// 数据库中的原始行
struct LedgerRow {
    key: String,
    local_path: String,
    size: i64,
    mod_time: i64,
    session_id: String,
    chunk_size: i64,
    committed_chunks: String,
    created_at: i64,
    expires_at: i64,
}

impl LedgerRow {
    fn into_record(self) -> Result<LedgerRecord, LedgerError> {
        let indices: Vec<usize> = serde_json::from_str(&self.committed_chunks)?;
        let mut committed_chunks = BitSet::new();
        for index in indices {
            committed_chunks.insert(index);
        }
        let created_at = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| LedgerError::Corrupted(format!("created_at={}", self.created_at)))?;
        let expires_at = Utc
            .timestamp_millis_opt(self.expires_at)
            .single()
            .ok_or_else(|| LedgerError::Corrupted(format!("expires_at={}", self.expires_at)))?;

        Ok(LedgerRecord {
            key: self.key,
            local_path: self.local_path,
            size: self.size as u64,
            mod_time: self.mod_time,
            session_id: self.session_id,
            chunk_size: self.chunk_size as u64,
            committed_chunks,
            created_at,
            expires_at,
        })
    }
}

/// 断点续传记录库
pub struct ResumableLedger {
    conn: Mutex<Option<Connection>>,
    db_path: PathBuf,
    /// 新记录的有效期
    ttl: Duration,
}

impl ResumableLedger {
    /// 打开（或创建）记录库，并清理已过期的记录
    pub fn open(db_path: &Path, ttl: Duration) -> Result<Self, LedgerError> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::init_tables(&conn)?;

        let ledger = Self {
            conn: Mutex::new(Some(conn)),
            db_path: db_path.to_path_buf(),
            ttl,
        };

        let purged = ledger.purge_expired()?;
        info!(
            "续传记录库已打开: {:?}, 清理过期记录 {} 条, 现存 {} 条",
            db_path,
            purged,
            ledger.len()?
        );
        Ok(ledger)
    }

    fn init_tables(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS uploading (
                key TEXT PRIMARY KEY,
                local_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                mod_time INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                committed_chunks TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_uploading_local_path ON uploading(local_path)",
            [],
        )?;
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(LedgerError::Closed)?;
        f(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 新记录的有效期
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// 关闭记录库，之后的所有操作返回 [`LedgerError::Closed`]
    pub fn close(&self) -> Result<(), LedgerError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| LedgerError::Sqlite(e))?;
        debug!("续传记录库已关闭: {:?}", self.db_path);
        Ok(())
    }

    /// 查询记录，过期记录视为不存在并删除
    pub fn get(&self, key: &str) -> Result<Option<LedgerRecord>, LedgerError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT key, local_path, size, mod_time, session_id, chunk_size,
                           committed_chunks, created_at, expires_at
                    FROM uploading
                    WHERE key = ?1
                    "#,
                    params![key],
                    |row| {
                        Ok(LedgerRow {
                            key: row.get(0)?,
                            local_path: row.get(1)?,
                            size: row.get(2)?,
                            mod_time: row.get(3)?,
                            session_id: row.get(4)?,
                            chunk_size: row.get(5)?,
                            committed_chunks: row.get(6)?,
                            created_at: row.get(7)?,
                            expires_at: row.get(8)?,
                        })
                    },
                )
                .optional()?;

            let Some(row) = row else {
                return Ok(None);
            };

            let record = match row.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!("续传记录损坏, 已删除: key={}, 错误: {}", key, e);
                    conn.execute("DELETE FROM uploading WHERE key = ?1", params![key])?;
                    return Ok(None);
                }
            };

            if record.is_expired(Utc::now()) {
                debug!("续传记录已过期, 删除: key={}", key);
                conn.execute("DELETE FROM uploading WHERE key = ?1", params![key])?;
                return Ok(None);
            }
            Ok(Some(record))
        })
    }

    /// 插入或覆盖记录
    pub fn put(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let committed = serde_json::to_string(&record.committed_indices())?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO uploading (
                    key, local_path, size, mod_time, session_id, chunk_size,
                    committed_chunks, created_at, expires_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    record.key,
                    record.local_path,
                    record.size as i64,
                    record.mod_time,
                    record.session_id,
                    record.chunk_size as i64,
                    committed,
                    record.created_at.timestamp_millis(),
                    record.expires_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    /// 删除记录，返回是否存在
    pub fn delete(&self, key: &str) -> Result<bool, LedgerError> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM uploading WHERE key = ?1", params![key])?;
            Ok(deleted > 0)
        })
    }

    /// 删除同一本地路径下其他身份标识的记录（文件已变化，旧记录不可再用）
    pub fn delete_stale_for_path(&self, local_path: &str, keep_key: &str) -> Result<usize, LedgerError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM uploading WHERE local_path = ?1 AND key != ?2",
                params![local_path, keep_key],
            )?;
            if deleted > 0 {
                debug!("已删除 {} 条失效的续传记录: {}", deleted, local_path);
            }
            Ok(deleted)
        })
    }

    /// 清理所有过期记录
    pub fn purge_expired(&self) -> Result<usize, LedgerError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM uploading WHERE expires_at <= ?1",
                params![now],
            )?;
            Ok(deleted)
        })
    }

    pub fn len(&self) -> Result<usize, LedgerError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM uploading", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}

impl Drop for ResumableLedger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("关闭续传记录库失败: {:?}, 错误: {}", self.db_path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(3600);

    fn record(key: &str, local_path: &str) -> LedgerRecord {
        let now = Utc::now();
        LedgerRecord {
            key: key.to_string(),
            local_path: local_path.to_string(),
            size: 12,
            mod_time: 1_700_000_000,
            session_id: format!("session-{}", key),
            chunk_size: 4,
            committed_chunks: BitSet::new(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumableLedger::open(&dir.path().join("db/uploading.db"), TTL).unwrap();

        let mut rec = record("k1", "/data/a.bin");
        rec.mark_committed(0);
        rec.mark_committed(2);
        ledger.put(&rec).unwrap();

        let loaded = ledger.get("k1").unwrap().unwrap();
        assert_eq!(loaded.committed_indices(), vec![0, 2]);
        assert_eq!(loaded.session_id, "session-k1");
        assert_eq!(loaded.expires_at.timestamp_millis(), rec.expires_at.timestamp_millis());

        assert!(ledger.delete("k1").unwrap());
        assert!(!ledger.delete("k1").unwrap());
        assert!(ledger.get("k1").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploading.db");
        {
            let ledger = ResumableLedger::open(&path, TTL).unwrap();
            let mut rec = record("k1", "/data/a.bin");
            rec.mark_committed(1);
            ledger.put(&rec).unwrap();
            ledger.close().unwrap();
        }

        let ledger = ResumableLedger::open(&path, TTL).unwrap();
        let loaded = ledger.get("k1").unwrap().unwrap();
        assert_eq!(loaded.committed_indices(), vec![1]);
    }

    #[test]
    fn test_expired_records_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploading.db");
        let ledger = ResumableLedger::open(&path, TTL).unwrap();

        let mut rec = record("old", "/data/old.bin");
        rec.expires_at = Utc::now() - chrono::Duration::seconds(1);
        ledger.put(&rec).unwrap();
        ledger.put(&record("old2", "/data/old2.bin")).unwrap();
        assert_eq!(ledger.len().unwrap(), 2);

        assert!(ledger.get("old").unwrap().is_none());
        assert_eq!(ledger.len().unwrap(), 1);

        let mut rec = record("old3", "/data/old3.bin");
        rec.expires_at = Utc::now() - chrono::Duration::seconds(1);
        ledger.put(&rec).unwrap();
        drop(ledger);

        let reopened = ResumableLedger::open(&path, TTL).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_stale_for_path() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumableLedger::open(&dir.path().join("uploading.db"), TTL).unwrap();
        ledger.put(&record("v1", "/data/a.bin")).unwrap();
        ledger.put(&record("v2", "/data/a.bin")).unwrap();
        ledger.put(&record("other", "/data/b.bin")).unwrap();

        assert_eq!(ledger.delete_stale_for_path("/data/a.bin", "v2").unwrap(), 1);
        assert!(ledger.get("v1").unwrap().is_none());
        assert!(ledger.get("v2").unwrap().is_some());
        assert!(ledger.get("other").unwrap().is_some());
    }

    #[test]
    fn test_closed_ledger_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumableLedger::open(&dir.path().join("uploading.db"), TTL).unwrap();
        ledger.close().unwrap();
        assert!(!ledger.is_open());
        assert!(matches!(ledger.get("k"), Err(LedgerError::Closed)));
        assert!(matches!(ledger.put(&record("k", "/a")), Err(LedgerError::Closed)));
        ledger.close().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(ResumableLedger::open(&dir.path().join("uploading.db"), TTL).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let mut rec = record(&format!("k{}", i), &format!("/data/{}.bin", i));
                for chunk in 0..5 {
                    rec.mark_committed(chunk);
                    ledger.put(&rec).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(ledger.len().unwrap(), 8);
        for i in 0..8 {
            let rec = ledger.get(&format!("k{}", i)).unwrap().unwrap();
            assert_eq!(rec.committed_count(), 5);
        }
    }
}
