//! 登记器事件

use serde::{Deserialize, Serialize};

use super::handle::TaskSnapshot;

/// 登记器事件
///
/// 通过 `TaskRegistry::subscribe` 广播，WebSocket 原样转发给前端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// 新增任务
    TaskAdded { task: TaskSnapshot },
    /// 任务状态或进度变化
    TaskUpdated { task: TaskSnapshot },
    /// 任务已移除
    TaskRemoved { task_id: String },
    /// 总带宽变化
    BandwidthUpdated { download: u64, upload: u64 },
}

impl RegistryEvent {
    /// 关联的任务 ID
    pub fn task_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::TaskAdded { task } | RegistryEvent::TaskUpdated { task } => {
                Some(&task.id)
            }
            RegistryEvent::TaskRemoved { task_id } => Some(task_id),
            RegistryEvent::BandwidthUpdated { .. } => None,
        }
    }
}
