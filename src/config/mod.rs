// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 下载配置
    pub download: DownloadConfig,
    /// 存储配置
    #[serde(default)]
    pub store: StoreConfig,
    /// UI 刷新配置
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 兜底下载目录（既没有默认目录也没有最近使用目录时使用）
    pub download_dir: PathBuf,
}

impl DownloadConfig {
    /// 验证下载路径是否为绝对路径
    pub fn validate_download_dir(&self) -> Result<()> {
        if !self.download_dir.is_absolute() {
            anyhow::bail!(
                "下载目录必须是绝对路径，当前值: {:?}\n\
                 Windows 示例: D:\\Downloads\n\
                 Linux 示例: /home/user/downloads",
                self.download_dir
            );
        }

        tracing::debug!("✓ 路径格式验证通过（绝对路径）: {:?}", self.download_dir);
        Ok(())
    }

    /// 确保下载目录存在（不存在则自动创建）
    pub fn ensure_download_dir_exists(&self) -> Result<()> {
        self.validate_download_dir()?;

        std::fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("无法创建下载目录: {:?}", self.download_dir))?;

        tracing::info!("下载目录已准备就绪: {:?}", self.download_dir);
        Ok(())
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/registry.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// UI 刷新配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// 是否启用
    #[serde(default = "default_refresh_enabled")]
    pub enabled: bool,
    /// 刷新周期（毫秒）
    #[serde(default = "default_refresh_interval_ms")]
    pub interval_ms: u64,
}

fn default_refresh_enabled() -> bool {
    true
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

/// 刷新周期下限
const MIN_REFRESH_INTERVAL_MS: u64 = 50;

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_REFRESH_INTERVAL_MS))
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: default_refresh_enabled(),
            interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // 本地环境：使用当前工作目录 + downloads
        let download_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("downloads");

        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 18888,
                cors_origins: default_cors_origins(),
            },
            download: DownloadConfig { download_dir },
            store: StoreConfig::default(),
            refresh: RefreshConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate_download_dir()
            .context("配置文件中的下载路径验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate_download_dir()
            .context("保存配置失败：下载路径必须是绝对路径")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.download.ensure_download_dir_exists() {
                    tracing::error!("{:#}", e);
                }

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
