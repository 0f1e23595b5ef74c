//! 启动/列表时的对账
//!
//! 以持久化记录为准重建任务集合：
//! 1. 枚举引擎存活传输，按 ID 建索引
//! 2. 遍历 `Tasks` 命名空间的记录
//! 3. 解析保存目录令牌（失败只记录警告，任务照常列出）
//! 4. 记录关联的传输不在引擎中时，句柄没有存活传输
//!
//! 对账不写回存储。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::collection::TaskCollection;
use super::error::RegistryError;
use super::handle::TaskHandle;
use super::record::TaskRecord;
use crate::access::{FolderAccessResolver, FolderHandle};
use crate::engine::{TransferEngine, TransferOperation};
use crate::store::RecordNamespace;

/// 对账统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub records: usize,
    pub attached: usize,
    pub detached: usize,
    pub unresolved_folders: usize,
    pub malformed: usize,
}

pub(crate) async fn reconcile(
    engine: &dyn TransferEngine,
    tasks: &dyn RecordNamespace,
    resolver: &dyn FolderAccessResolver,
    generation: u64,
) -> Result<(TaskCollection, ReconcileStats), RegistryError> {
    let mut live: HashMap<String, Arc<dyn TransferOperation>> = engine
        .enumerate_live()
        .await?
        .into_iter()
        .map(|op| (op.id().to_string(), op))
        .collect();

    let entries = tasks.enumerate()?;
    let mut stats = ReconcileStats::default();
    // 同一目录的任务很多，每轮对账只解析一次
    let mut folders: HashMap<String, Option<FolderHandle>> = HashMap::new();
    let mut handles = Vec::with_capacity(entries.len());

    for (id, value) in entries {
        let record = match TaskRecord::from_stored(&id, &value) {
            Ok(record) => record,
            Err(e) => {
                warn!("跳过损坏的任务记录: {}", e);
                stats.malformed += 1;
                continue;
            }
        };
        stats.records += 1;

        let token = record.folder_token().to_string();
        let folder = match folders.get(&token) {
            Some(folder) => folder.clone(),
            None => {
                let folder = match resolver.resolve(&token).await {
                    Ok(folder) => Some(folder),
                    Err(e) => {
                        warn!("任务 {} 的保存目录无法解析: {}", id, e);
                        None
                    }
                };
                folders.insert(token, folder.clone());
                folder
            }
        };
        if folder.is_none() {
            stats.unresolved_folders += 1;
        }

        let op = if record.engine_handle_id().is_empty() {
            None
        } else {
            live.remove(record.engine_handle_id())
        };
        if op.is_some() {
            stats.attached += 1;
        } else {
            stats.detached += 1;
        }

        handles.push(TaskHandle::new(record, op, folder));
    }

    if !live.is_empty() {
        debug!("引擎中有 {} 个传输不属于任何任务记录", live.len());
    }
    debug!(
        "对账完成: 代号={}, 记录={}, 关联={}, 无传输={}, 目录失效={}, 损坏={}",
        generation,
        stats.records,
        stats.attached,
        stats.detached,
        stats.unresolved_folders,
        stats.malformed
    );

    Ok((TaskCollection::new(generation, handles), stats))
}
