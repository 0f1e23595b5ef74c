//! 文件夹访问授权
//!
//! 文件夹句柄本身不保证可以持久化，持久化的是授权令牌：
//! 添加任务时把保存目录登记为令牌，重启后再用令牌换回目录句柄。
//! 目录被删除、卸载或改名后令牌会解析失败（`AccessError`），调用方自行丢弃。

pub mod folder;
pub mod token_list;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::StoreError;

pub use folder::FolderHandle;
pub use token_list::AccessTokenList;

/// 访问授权错误
#[derive(Error, Debug)]
pub enum AccessError {
    /// 令牌从未登记或已被移除
    #[error("未知的访问令牌: {0}")]
    UnknownToken(String),

    /// 目录已不可访问
    #[error("目录不可访问 {path}: {reason}")]
    Unreachable { path: String, reason: String },

    /// 令牌存储失败
    #[error("令牌存储失败: {0}")]
    Store(#[from] StoreError),
}

/// 文件夹访问解析器
#[async_trait]
pub trait FolderAccessResolver: Send + Sync {
    /// 登记目录，返回可持久化的令牌
    async fn add_token(&self, folder: &FolderHandle) -> Result<String, AccessError>;

    /// 用令牌换回目录句柄
    async fn resolve(&self, token: &str) -> Result<FolderHandle, AccessError>;
}
