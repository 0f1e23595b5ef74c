//! 登记器错误类型

use thiserror::Error;

use super::record::TaskStatus;
use crate::access::AccessError;
use crate::engine::EngineError;
use crate::store::StoreError;

/// 任务级命令错误
#[derive(Error, Debug)]
pub enum TaskError {
    /// 引擎执行命令失败
    #[error("任务 {id} 执行 {command} 失败: {source}")]
    Engine {
        id: String,
        command: &'static str,
        source: EngineError,
    },

    /// 引擎中已没有对应的传输（例如引擎重启后）
    #[error("任务 {0} 没有可用的传输")]
    NoLiveTransfer(String),

    /// 任务已结束，不能再启动
    #[error("任务 {id} 已结束 ({status})")]
    Finished { id: String, status: TaskStatus },
}

/// 登记器错误
#[derive(Error, Debug)]
pub enum RegistryError {
    /// 持久化存储无法打开
    #[error("初始化失败: {0}")]
    Initialization(#[source] StoreError),

    /// 文件夹令牌无法解析或登记
    #[error("目录访问失败: {0}")]
    Access(#[from] AccessError),

    /// 创建目标文件或提交传输失败
    #[error("创建任务失败: {0}")]
    Creation(String),

    /// 存储读写失败
    #[error("存储读写失败: {0}")]
    Store(#[from] StoreError),

    /// 枚举引擎传输失败
    #[error("传输引擎错误: {0}")]
    Engine(#[from] EngineError),

    /// 任务级命令失败
    #[error(transparent)]
    Task(#[from] TaskError),
}
