//! 任务句柄
//!
//! 句柄 = 持久化记录 + 引擎中的存活传输（可能没有）+ 解析出的保存目录（可能没有）。
//! 克隆代价很低，列表视图、事件、HTTP 接口都直接持有句柄。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::TaskError;
use super::record::{TaskRecord, TaskStatus};
use crate::access::FolderHandle;
use crate::engine::{EngineError, TransferOperation, TransferProgress};

/// 单次刷新的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// 状态或进度是否变化
    pub changed: bool,
    /// 当前接收速度
    pub speed: u64,
}

/// 任务快照（序列化给前端）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub source_uri: String,
    pub file_name: String,
    pub status: TaskStatus,
    pub is_final: bool,
    pub engine_handle_id: String,
    pub has_live_transfer: bool,
    pub save_path: Option<String>,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub bytes_received_speed: u64,
    pub error: Option<String>,
}

struct HandleInner {
    id: String,
    record: RwLock<TaskRecord>,
    live: Option<Arc<dyn TransferOperation>>,
    folder: Option<FolderHandle>,
    last_progress: Mutex<Option<TransferProgress>>,
}

/// 任务句柄
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    pub(crate) fn new(
        record: TaskRecord,
        live: Option<Arc<dyn TransferOperation>>,
        folder: Option<FolderHandle>,
    ) -> Self {
        let mut record = record;
        // 有存活传输时以引擎状态为准（只改内存，不写回）
        let last_progress = live.as_ref().map(|live| {
            let progress = live.progress();
            if let Some(next) = TaskStatus::from_transfer_state(progress.state) {
                record.set_status(next);
            }
            progress
        });

        Self {
            inner: Arc::new(HandleInner {
                id: record.id().to_string(),
                record: RwLock::new(record),
                live,
                folder,
                last_progress: Mutex::new(last_progress),
            }),
        }
    }

    /// 接过上一轮对账中同一任务的通知基线
    ///
    /// 上一轮已经是终态的任务保持终态
    pub(crate) fn inherit_from(&self, previous: &TaskHandle) {
        if Arc::ptr_eq(&self.inner, &previous.inner) {
            return;
        }
        if previous.is_final() {
            self.apply_status(previous.status());
        }
        let baseline = previous.inner.last_progress.lock().clone();
        *self.inner.last_progress.lock() = baseline;
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source_uri(&self) -> String {
        self.inner.record.read().source_uri().to_string()
    }

    pub fn file_name(&self) -> String {
        self.inner.record.read().file_name().to_string()
    }

    pub fn folder_token(&self) -> String {
        self.inner.record.read().folder_token().to_string()
    }

    pub fn engine_handle_id(&self) -> String {
        self.inner.record.read().engine_handle_id().to_string()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.record.read().status()
    }

    pub fn is_final(&self) -> bool {
        self.status().is_final()
    }

    /// 当前记录的副本
    pub fn record(&self) -> TaskRecord {
        self.inner.record.read().clone()
    }

    pub fn has_live_transfer(&self) -> bool {
        self.inner.live.is_some()
    }

    /// 保存目录（令牌失效时为 None）
    pub fn folder(&self) -> Option<&FolderHandle> {
        self.inner.folder.as_ref()
    }

    /// 目标文件完整路径
    pub fn save_file_path(&self) -> Option<PathBuf> {
        let name = self.file_name();
        self.inner.folder.as_ref().map(|f| f.file_path(&name))
    }

    /// 引擎报告的进度，没有存活传输时为 None
    pub fn progress(&self) -> Option<TransferProgress> {
        self.inner.live.as_ref().map(|live| live.progress())
    }

    /// 瞬时接收速度，没有存活传输时为 0
    pub fn bytes_received_speed(&self) -> u64 {
        self.progress().map(|p| p.bytes_received_speed).unwrap_or(0)
    }

    /// 两个句柄是否指向同一任务
    pub fn same_task(&self, other: &TaskHandle) -> bool {
        self.inner.id == other.inner.id
    }

    fn live(&self) -> Result<&Arc<dyn TransferOperation>, TaskError> {
        self.inner
            .live
            .as_ref()
            .ok_or_else(|| TaskError::NoLiveTransfer(self.inner.id.clone()))
    }

    fn engine_error(&self, command: &'static str, source: EngineError) -> TaskError {
        TaskError::Engine {
            id: self.inner.id.clone(),
            command,
            source,
        }
    }

    /// 按迁移规则修改状态，返回是否变化
    pub(crate) fn apply_status(&self, status: TaskStatus) -> bool {
        self.inner.record.write().set_status(status)
    }

    /// 开始传输
    pub async fn start(&self) -> Result<(), TaskError> {
        let status = self.status();
        if status.is_final() {
            return Err(TaskError::Finished {
                id: self.inner.id.clone(),
                status,
            });
        }
        let live = self.live()?;
        live.start().await.map_err(|e| self.engine_error("start", e))?;
        self.apply_status(TaskStatus::Running);
        debug!("任务已开始: {}", self.inner.id);
        Ok(())
    }

    /// 暂停，已结束的任务直接返回
    pub async fn pause(&self) -> Result<(), TaskError> {
        if self.is_final() {
            return Ok(());
        }
        let live = self.live()?;
        live.pause().await.map_err(|e| self.engine_error("pause", e))?;
        self.apply_status(TaskStatus::Paused);
        debug!("任务已暂停: {}", self.inner.id);
        Ok(())
    }

    /// 恢复，已结束的任务直接返回
    pub async fn resume(&self) -> Result<(), TaskError> {
        if self.is_final() {
            return Ok(());
        }
        let live = self.live()?;
        live.resume().await.map_err(|e| self.engine_error("resume", e))?;
        self.apply_status(TaskStatus::Running);
        debug!("任务已恢复: {}", self.inner.id);
        Ok(())
    }

    /// 取消
    ///
    /// 没有存活传输时只修改状态
    pub async fn cancel(&self) -> Result<(), TaskError> {
        if self.is_final() {
            return Ok(());
        }
        if let Some(live) = &self.inner.live {
            live.cancel().await.map_err(|e| self.engine_error("cancel", e))?;
        }
        self.apply_status(TaskStatus::Canceled);
        info!("任务已取消: {}", self.inner.id);
        Ok(())
    }

    /// 按引擎状态更新记录状态
    ///
    /// 只在迁移规则允许时修改；返回是否有变化以及当前速度
    pub fn refresh_from_live(&self) -> RefreshOutcome {
        let Some(live) = &self.inner.live else {
            return RefreshOutcome::default();
        };
        let progress = live.progress();
        let speed = progress.bytes_received_speed;

        let mut changed = match TaskStatus::from_transfer_state(progress.state) {
            Some(next) => self.inner.record.write().set_status(next),
            None => false,
        };

        let mut last = self.inner.last_progress.lock();
        if last.as_ref() != Some(&progress) {
            changed = true;
            *last = Some(progress);
        }

        RefreshOutcome { changed, speed }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let record = self.record();
        let progress = self.progress();
        TaskSnapshot {
            id: record.id().to_string(),
            source_uri: record.source_uri().to_string(),
            file_name: record.file_name().to_string(),
            status: record.status(),
            is_final: record.status().is_final(),
            engine_handle_id: record.engine_handle_id().to_string(),
            has_live_transfer: self.has_live_transfer(),
            save_path: self
                .save_file_path()
                .map(|p| p.to_string_lossy().into_owned()),
            bytes_received: progress.as_ref().map(|p| p.bytes_received).unwrap_or(0),
            total_bytes: progress.as_ref().and_then(|p| p.total_bytes),
            bytes_received_speed: progress
                .as_ref()
                .map(|p| p.bytes_received_speed)
                .unwrap_or(0),
            error: progress.and_then(|p| p.error),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("live", &self.has_live_transfer())
            .finish()
    }
}
