//! 下载任务登记与对账
//!
//! - `record`: 持久化任务记录与状态机
//! - `handle`: 任务句柄（记录 + 存活传输）
//! - `collection`: 带代号的任务集合与只读视图
//! - `reconcile`: 记录与引擎存活传输对账
//! - `refresh`: 后台 UI 刷新
//! - `manager`: `TaskRegistry` 对外接口

pub mod collection;
pub mod error;
pub mod events;
pub mod handle;
pub mod manager;
pub mod reconcile;
pub mod record;
pub mod refresh;

pub use collection::{SlotKey, TaskCollection, TaskListView};
pub use error::{RegistryError, TaskError};
pub use events::RegistryEvent;
pub use handle::{RefreshOutcome, TaskHandle, TaskSnapshot};
pub use manager::{
    RegistryOptions, TaskRegistry, DEFAULT_FOLDER_KEY, LAST_USED_FOLDER_KEY, VERSION,
};
pub use reconcile::ReconcileStats;
pub use record::{file_name_from_uri, RecordError, TaskRecord, TaskStatus};
pub use refresh::RefreshSummary;
