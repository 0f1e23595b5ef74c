//! SQLite 记录存储
//!
//! 所有命名空间共用一张 `entries` 表：
//! - `(namespace, key)` 唯一
//! - `seq` 自增，`enumerate` 按 `seq` 排序，保证返回首次写入顺序
//! - 值以 JSON 文本保存

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{RecordNamespace, RecordStore, StoreError, StoredValue};

/// SQLite 存储
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("创建存储目录失败 {:?}: {}", parent, e))
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|source| StoreError::Open {
            path: db_path.to_path_buf(),
            source,
        })?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        };
        store.init_tables()?;

        info!("记录存储已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库（主要用于测试）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 数据库文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(namespace, key)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace, seq);
            "#,
        )?;

        debug!("记录存储表初始化完成");
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn open_namespace(&self, name: &str) -> Result<Arc<dyn RecordNamespace>, StoreError> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?1, ?2)",
                params![name, chrono::Utc::now().timestamp()],
            )?;
        }

        Ok(Arc::new(SqliteNamespace {
            conn: Arc::clone(&self.conn),
            name: name.to_string(),
        }))
    }
}

/// SQLite 命名空间句柄
struct SqliteNamespace {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl RecordNamespace for SqliteNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM entries WHERE namespace = ?1 AND key = ?2",
                params![self.name, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let json = serde_json::to_string(&value)?;
        let conn = self.conn.lock();
        // 冲突时只更新值，保留原 seq（即保留插入顺序）
        conn.execute(
            r#"
            INSERT INTO entries (namespace, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![self.name, key, json, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
            params![self.name, key],
        )?;
        Ok(affected > 0)
    }

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM entries WHERE namespace = ?1 AND key = ?2",
                params![self.name, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn enumerate(&self) -> Result<Vec<(String, StoredValue)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM entries WHERE namespace = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![self.name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, json) = row?;
            entries.push((key, serde_json::from_str(&json)?));
        }
        Ok(entries)
    }
}
