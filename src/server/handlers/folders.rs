// 保存目录API处理器

use crate::access::FolderHandle;
use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info};

use super::ApiResponse;

/// 目录信息
#[derive(Debug, Serialize)]
pub struct FolderInfo {
    /// 用户设置的默认目录
    pub default_folder: Option<String>,
    /// 最近一次添加任务使用的目录
    pub last_used_folder: Option<String>,
    /// 配置的兜底下载目录
    pub fallback_folder: String,
}

/// 设置默认目录请求，`path` 为空表示清除
#[derive(Debug, Deserialize)]
pub struct SetDefaultFolderRequest {
    #[serde(default)]
    pub path: Option<String>,
}

fn display(folder: &FolderHandle) -> String {
    folder.path().to_string_lossy().into_owned()
}

/// GET /api/v1/folders/default
pub async fn get_folders(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<FolderInfo>>, StatusCode> {
    let registry = &app_state.registry;
    Ok(Json(ApiResponse::success(FolderInfo {
        default_folder: registry.default_folder().await.as_ref().map(display),
        last_used_folder: registry.last_used_folder().await.as_ref().map(display),
        fallback_folder: display(&app_state.fallback_folder().await),
    })))
}

/// PUT /api/v1/folders/default
pub async fn set_default_folder(
    State(app_state): State<AppState>,
    Json(req): Json<SetDefaultFolderRequest>,
) -> Result<Json<ApiResponse<FolderInfo>>, StatusCode> {
    let folder = match req.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                return Ok(Json(ApiResponse::error(
                    400,
                    format!("默认目录必须是绝对路径: {:?}", path),
                )));
            }
            if !tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                return Ok(Json(ApiResponse::error(
                    400,
                    format!("目录不存在: {:?}", path),
                )));
            }
            Some(FolderHandle::new(path))
        }
        None => None,
    };

    if let Err(e) = app_state.registry.set_default_folder(folder.as_ref()).await {
        error!("设置默认目录失败: {}", e);
        return Ok(Json(ApiResponse::from_registry_error(&e)));
    }
    info!("API: 默认目录已更新: {:?}", folder.as_ref().map(|f| f.path()));

    get_folders(State(app_state)).await
}
