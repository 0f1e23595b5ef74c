//! 传输引擎接口
//!
//! 引擎负责真正的网络传输。登记器只通过下面两个 trait 与引擎交互：
//! - `TransferEngine`：提交下载、枚举当前存活的传输
//! - `TransferOperation`：单个传输的控制命令与进度

pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod speed;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpTransferEngine;
pub use speed::SpeedMeter;

/// 传输引擎错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 源地址无效
    #[error("无效的源地址: {0}")]
    InvalidUri(String),

    /// 提交失败
    #[error("提交传输失败: {0}")]
    Submit(String),

    /// HTTP 请求失败
    #[error("HTTP 请求失败: {0}")]
    Request(#[from] reqwest::Error),

    /// 文件读写失败
    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    /// 当前状态下不允许该命令
    #[error("传输 {id} 处于 {state:?} 状态，无法执行 {command}")]
    InvalidState {
        id: String,
        state: TransferState,
        command: &'static str,
    },
}

/// 引擎侧传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// 已创建，尚未开始
    Idle,
    /// 传输中
    Running,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 出错
    Error,
    /// 已取消
    Canceled,
}

impl TransferState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Error | TransferState::Canceled
        )
    }
}

/// 传输进度快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub state: TransferState,
    /// 已接收字节数
    pub bytes_received: u64,
    /// 总字节数（服务器未告知时为 None）
    pub total_bytes: Option<u64>,
    /// 瞬时接收速度 (bytes/s)
    pub bytes_received_speed: u64,
    /// 最近一次错误
    pub error: Option<String>,
}

/// 单个传输
#[async_trait]
pub trait TransferOperation: Send + Sync {
    /// 引擎分配的传输 ID
    fn id(&self) -> &str;

    fn progress(&self) -> TransferProgress;

    async fn start(&self) -> Result<(), EngineError>;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn cancel(&self) -> Result<(), EngineError>;
}

/// 传输引擎
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// 提交下载，返回的传输尚未开始
    async fn submit(
        &self,
        uri: &str,
        destination: &Path,
    ) -> Result<Arc<dyn TransferOperation>, EngineError>;

    /// 枚举当前存活的传输
    async fn enumerate_live(&self) -> Result<Vec<Arc<dyn TransferOperation>>, EngineError>;
}
