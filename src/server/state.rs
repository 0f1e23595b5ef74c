// 应用状态

use crate::access::{AccessTokenList, FolderHandle};
use crate::config::AppConfig;
use crate::engine::HttpTransferEngine;
use crate::registry::{RegistryOptions, TaskRegistry};
use crate::store::SqliteRecordStore;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 下载任务登记器
    pub registry: Arc<TaskRegistry>,
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
}

impl AppState {
    /// 按配置创建应用状态：SQLite 存储 + HTTP 引擎 + 令牌表
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        config
            .download
            .ensure_download_dir_exists()
            .context("准备下载目录失败")?;

        if let Some(parent) = config.store.db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("无法创建数据目录: {:?}", parent))?;
        }

        let store = SqliteRecordStore::open(&config.store.db_path)
            .with_context(|| format!("无法打开任务数据库: {:?}", config.store.db_path))?;
        let tokens = AccessTokenList::open(&store).context("无法打开目录令牌表")?;
        let engine = HttpTransferEngine::new().context("无法创建 HTTP 传输引擎")?;

        let options = RegistryOptions {
            enable_ui_refresh: config.refresh.enabled,
            refresh_interval: config.refresh.interval(),
        };
        let registry = TaskRegistry::initialize(&store, Arc::new(engine), Arc::new(tokens), options)
            .await
            .context("下载任务登记器初始化失败")?;

        info!("任务数据库: {:?}", store.path());
        Ok(Self::with_registry(registry, config))
    }

    pub fn with_registry(registry: TaskRegistry, config: AppConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// 配置的兜底下载目录
    pub async fn fallback_folder(&self) -> FolderHandle {
        FolderHandle::new(self.config.read().await.download.download_dir.clone())
    }

    /// 决定保存目录：请求指定 → 默认目录 → 最近使用目录 → 配置的下载目录
    pub async fn resolve_save_folder(&self, requested: Option<&str>) -> anyhow::Result<FolderHandle> {
        if let Some(path) = requested.map(str::trim).filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                anyhow::bail!("保存目录必须是绝对路径: {:?}", path);
            }
            return Ok(FolderHandle::new(path));
        }

        if let Some(folder) = self.registry.default_folder().await {
            return Ok(folder);
        }
        if let Some(folder) = self.registry.last_used_folder().await {
            return Ok(folder);
        }

        let folder = self.fallback_folder().await;
        tokio::fs::create_dir_all(folder.path())
            .await
            .with_context(|| format!("无法创建下载目录: {:?}", folder.path()))?;
        Ok(folder)
    }

    /// 优雅关闭
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
