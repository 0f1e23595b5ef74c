//! 持久化记录存储
//!
//! 以"命名空间 + 键"的方式保存结构化记录，进程重启后依然可用：
//! - 根命名空间：保存 `LastusedFolder` / `DefaultFolder` 等标量值
//! - `Tasks` 命名空间：每个任务一条复合记录，键为任务 ID
//!
//! ## 存储结构
//!
//! ```text
//! <root>
//! ├── LastusedFolder = "token"
//! ├── DefaultFolder  = "token"
//! └── Tasks
//!     └── {task_id} = { SourceUri, FileName, SaveFolder, Status, EngineHandleId }
//! ```

pub mod error;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

/// 根命名空间名称
pub const ROOT_NAMESPACE: &str = "Root";

/// 任务命名空间名称
pub const TASKS_NAMESPACE: &str = "Tasks";

/// 记录字段的原始值（字符串、整数；枚举以整数保存）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Int(i64),
    Str(String),
}

impl RecordValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RecordValue::Str(s) => Some(s),
            RecordValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RecordValue::Int(v) => Some(*v),
            RecordValue::Str(_) => None,
        }
    }
}

impl From<&str> for RecordValue {
    fn from(value: &str) -> Self {
        RecordValue::Str(value.to_string())
    }
}

impl From<String> for RecordValue {
    fn from(value: String) -> Self {
        RecordValue::Str(value)
    }
}

impl From<i64> for RecordValue {
    fn from(value: i64) -> Self {
        RecordValue::Int(value)
    }
}

/// 复合记录：字段名 -> 原始值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, RecordValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入字段（已存在则覆盖）
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<RecordValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&RecordValue> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(RecordValue::as_str)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(RecordValue::as_int)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// 命名空间中保存的值：标量或复合记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Scalar(RecordValue),
    Composite(Record),
}

impl StoredValue {
    pub fn as_scalar(&self) -> Option<&RecordValue> {
        match self {
            StoredValue::Scalar(v) => Some(v),
            StoredValue::Composite(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            StoredValue::Composite(r) => Some(r),
            StoredValue::Scalar(_) => None,
        }
    }
}

/// 持久化存储
///
/// 实现方需保证 `open_namespace` 对同名命名空间幂等（不存在则创建）
pub trait RecordStore: Send + Sync {
    fn open_namespace(&self, name: &str) -> Result<Arc<dyn RecordNamespace>, StoreError>;
}

/// 单个命名空间
///
/// `enumerate` 按首次写入的顺序返回；覆盖写入不改变位置
pub trait RecordNamespace: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StoreError>;

    /// 删除键，返回是否真的删除了
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    fn has(&self, key: &str) -> Result<bool, StoreError>;

    fn enumerate(&self) -> Result<Vec<(String, StoredValue)>, StoreError>;

    /// 读取字符串标量，类型不符时视为不存在
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get(key)?
            .and_then(|v| v.as_scalar().and_then(|s| s.as_str().map(str::to_string))))
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, StoredValue::Scalar(RecordValue::from(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_typed_access() {
        let mut record = Record::new();
        record.insert("FileName", "file.bin");
        record.insert("Status", 2i64);

        assert_eq!(record.get_str("FileName"), Some("file.bin"));
        assert_eq!(record.get_int("Status"), Some(2));
        // 类型不匹配时返回 None
        assert_eq!(record.get_int("FileName"), None);
        assert_eq!(record.get_str("Missing"), None);
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_stored_value_json_shape() {
        let mut record = Record::new();
        record.insert("Status", 0i64);
        let json = serde_json::to_string(&StoredValue::Composite(record.clone())).unwrap();
        assert_eq!(json, r#"{"kind":"composite","value":{"Status":0}}"#);

        let parsed: StoredValue = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_record(), Some(&record));

        let scalar: StoredValue =
            serde_json::from_str(r#"{"kind":"scalar","value":"abc"}"#).unwrap();
        assert_eq!(scalar.as_scalar(), Some(&RecordValue::Str("abc".to_string())));
    }
}
