//! 内存记录存储
//!
//! 不落盘，进程退出即丢失；同一个 `MemoryRecordStore` 实例内重新打开命名空间
//! 可以拿到之前写入的数据，用于模拟"重启"

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{RecordNamespace, RecordStore, StoreError, StoredValue};

type Entries = Arc<Mutex<Vec<(String, StoredValue)>>>;

/// 内存存储
#[derive(Default, Clone)]
pub struct MemoryRecordStore {
    namespaces: Arc<Mutex<HashMap<String, Entries>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn open_namespace(&self, name: &str) -> Result<Arc<dyn RecordNamespace>, StoreError> {
        let entries = self
            .namespaces
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();

        Ok(Arc::new(MemoryNamespace {
            name: name.to_string(),
            entries,
        }))
    }
}

struct MemoryNamespace {
    name: String,
    entries: Entries,
}

impl RecordNamespace for MemoryNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        Ok(entries.len() != before)
    }

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().iter().any(|(k, _)| k == key))
    }

    fn enumerate(&self) -> Result<Vec<(String, StoredValue)>, StoreError> {
        Ok(self.entries.lock().clone())
    }
}
