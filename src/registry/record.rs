//! 任务记录
//!
//! 持久化到 `Tasks` 命名空间的字段：
//!
//! | 字段 | 类型 | 说明 |
//! |------|------|------|
//! | `SourceUri` | 字符串 | 源地址，创建后不变 |
//! | `FileName` | 字符串 | 实际创建的文件名 |
//! | `SaveFolder` | 字符串 | 保存目录的访问令牌，创建后不变 |
//! | `Status` | 整数 | `TaskStatus` 枚举值 |
//! | `EngineHandleId` | 字符串 | 引擎传输 ID，可能已失效 |

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::TransferState;
use crate::store::{Record, StoredValue};

const FIELD_SOURCE_URI: &str = "SourceUri";
const FIELD_FILE_NAME: &str = "FileName";
const FIELD_SAVE_FOLDER: &str = "SaveFolder";
const FIELD_STATUS: &str = "Status";
const FIELD_ENGINE_HANDLE_ID: &str = "EngineHandleId";

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队中
    Queued = 0,
    /// 传输中
    Running = 1,
    /// 已暂停
    Paused = 2,
    /// 已完成
    Completed = 3,
    /// 出错
    Error = 4,
    /// 已取消
    Canceled = 5,
}

impl TaskStatus {
    /// 是否为终态（完成、出错、取消）
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Canceled
        )
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Queued),
            1 => Some(TaskStatus::Running),
            2 => Some(TaskStatus::Paused),
            3 => Some(TaskStatus::Completed),
            4 => Some(TaskStatus::Error),
            5 => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    /// 状态迁移规则：终态不再变化，其余状态之间可以自由切换
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self != next && !self.is_final()
    }

    /// 引擎状态对应的任务状态；`Idle` 没有对应（保持原状态）
    pub fn from_transfer_state(state: TransferState) -> Option<Self> {
        match state {
            TransferState::Idle => None,
            TransferState::Running => Some(TaskStatus::Running),
            TransferState::Paused => Some(TaskStatus::Paused),
            TransferState::Completed => Some(TaskStatus::Completed),
            TransferState::Error => Some(TaskStatus::Error),
            TransferState::Canceled => Some(TaskStatus::Canceled),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// 记录解析错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("记录 {0} 不是复合值")]
    NotComposite(String),

    #[error("记录 {id} 缺少字段 {field}")]
    MissingField { id: String, field: &'static str },

    #[error("记录 {id} 状态值非法: {value}")]
    InvalidStatus { id: String, value: i64 },
}

/// 任务记录（持久化部分）
///
/// `id`、`source_uri`、`folder_token` 创建后只读；
/// 只有状态和引擎关联 ID 会在创建后变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    id: String,
    source_uri: String,
    file_name: String,
    folder_token: String,
    status: TaskStatus,
    engine_handle_id: String,
}

impl TaskRecord {
    /// 新建记录，分配全局唯一 ID，状态为 Queued
    pub fn new(
        source_uri: impl Into<String>,
        file_name: impl Into<String>,
        folder_token: impl Into<String>,
        engine_handle_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_uri: source_uri.into(),
            file_name: file_name.into(),
            folder_token: folder_token.into(),
            status: TaskStatus::Queued,
            engine_handle_id: engine_handle_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn folder_token(&self) -> &str {
        &self.folder_token
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn engine_handle_id(&self) -> &str {
        &self.engine_handle_id
    }

    /// 修改状态，违反迁移规则时忽略并返回 false
    pub fn set_status(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn set_engine_handle_id(&mut self, engine_handle_id: impl Into<String>) {
        self.engine_handle_id = engine_handle_id.into();
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(FIELD_SOURCE_URI, self.source_uri.as_str());
        record.insert(FIELD_FILE_NAME, self.file_name.as_str());
        record.insert(FIELD_SAVE_FOLDER, self.folder_token.as_str());
        record.insert(FIELD_STATUS, self.status.as_i64());
        record.insert(FIELD_ENGINE_HANDLE_ID, self.engine_handle_id.as_str());
        record
    }

    pub fn to_stored(&self) -> StoredValue {
        StoredValue::Composite(self.to_record())
    }

    /// 从存储值还原记录
    ///
    /// `EngineHandleId` 缺失时视为空（没有关联传输），其余字段必须存在
    pub fn from_stored(id: &str, value: &StoredValue) -> Result<Self, RecordError> {
        let record = value
            .as_record()
            .ok_or_else(|| RecordError::NotComposite(id.to_string()))?;

        let field = |name: &'static str| {
            record
                .get_str(name)
                .map(str::to_string)
                .ok_or(RecordError::MissingField {
                    id: id.to_string(),
                    field: name,
                })
        };

        let status_value = record.get_int(FIELD_STATUS).ok_or(RecordError::MissingField {
            id: id.to_string(),
            field: FIELD_STATUS,
        })?;
        let status = TaskStatus::from_i64(status_value).ok_or(RecordError::InvalidStatus {
            id: id.to_string(),
            value: status_value,
        })?;

        Ok(Self {
            id: id.to_string(),
            source_uri: field(FIELD_SOURCE_URI)?,
            file_name: field(FIELD_FILE_NAME)?,
            folder_token: field(FIELD_SAVE_FOLDER)?,
            status,
            engine_handle_id: record
                .get_str(FIELD_ENGINE_HANDLE_ID)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// 从源地址推断文件名（取路径最后一段并做 URL 解码）
pub fn file_name_from_uri(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?.into_owned();
    let trimmed = decoded.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') {
        return None;
    }
    Some(trimmed.to_string())
}
