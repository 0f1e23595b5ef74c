//! 基于记录存储的访问令牌表
//!
//! 令牌表保存在 `FolderAccess` 命名空间中：`{token} = { Path }`。
//! 同一目录重复登记返回已有令牌，避免令牌表无限增长。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AccessError, FolderAccessResolver, FolderHandle};
use crate::store::{Record, RecordNamespace, RecordStore, StoredValue};

/// 令牌表命名空间名称
pub const ACCESS_NAMESPACE: &str = "FolderAccess";

const FIELD_PATH: &str = "Path";

/// 访问令牌表
pub struct AccessTokenList {
    entries: Arc<dyn RecordNamespace>,
}

impl AccessTokenList {
    /// 在指定存储上打开令牌表
    pub fn open(store: &dyn RecordStore) -> Result<Self, AccessError> {
        let entries = store.open_namespace(ACCESS_NAMESPACE)?;
        Ok(Self { entries })
    }

    /// 移除令牌
    pub fn forget(&self, token: &str) -> Result<bool, AccessError> {
        let removed = self.entries.remove(token)?;
        if removed {
            info!("已移除访问令牌: {}", token);
        }
        Ok(removed)
    }

    fn find_token_by_path(&self, path: &str) -> Result<Option<String>, AccessError> {
        let found = self.entries.enumerate()?.into_iter().find_map(|(token, value)| {
            let stored_path = value.as_record()?.get_str(FIELD_PATH)?;
            (stored_path == path).then_some(token)
        });
        Ok(found)
    }
}

#[async_trait]
impl FolderAccessResolver for AccessTokenList {
    async fn add_token(&self, folder: &FolderHandle) -> Result<String, AccessError> {
        let path = folder.path().to_string_lossy().to_string();

        if let Some(token) = self.find_token_by_path(&path)? {
            debug!("目录已登记，复用令牌: {} -> {}", path, token);
            return Ok(token);
        }

        let token = Uuid::new_v4().to_string();
        let mut record = Record::new();
        record.insert(FIELD_PATH, path.as_str());
        self.entries.put(&token, StoredValue::Composite(record))?;

        info!("已登记目录访问令牌: {} -> {}", path, token);
        Ok(token)
    }

    async fn resolve(&self, token: &str) -> Result<FolderHandle, AccessError> {
        let path = self
            .entries
            .get(token)?
            .and_then(|v| v.as_record().and_then(|r| r.get_str(FIELD_PATH).map(str::to_string)))
            .ok_or_else(|| AccessError::UnknownToken(token.to_string()))?;

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(FolderHandle::new(path)),
            Ok(_) => Err(AccessError::Unreachable {
                path,
                reason: "不是目录".to_string(),
            }),
            Err(e) => Err(AccessError::Unreachable {
                path,
                reason: e.to_string(),
            }),
        }
    }
}
