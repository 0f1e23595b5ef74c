//! 存储层错误类型

use std::path::PathBuf;

use thiserror::Error;

/// 持久化存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    /// 无法打开或创建数据库文件
    #[error("打开存储失败 {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// 查询或写入失败
    #[error("存储操作失败: {0}")]
    Query(#[from] rusqlite::Error),

    /// 值编解码失败
    #[error("记录编解码失败: {0}")]
    Codec(#[from] serde_json::Error),

    /// 存储不可用（例如目录无法创建）
    #[error("存储不可用: {0}")]
    Unavailable(String),
}
