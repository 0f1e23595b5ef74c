// 下载任务API处理器

use crate::registry::{file_name_from_uri, RegistryError, TaskHandle, TaskSnapshot};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::ApiResponse;

/// 无法推断文件名时使用的名称
const FALLBACK_FILE_NAME: &str = "download";

/// 列表查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    /// 文件名过滤（不区分大小写的子串）
    #[serde(default)]
    pub search: String,
}

/// 添加任务请求
#[derive(Debug, Deserialize)]
pub struct AddTaskRequest {
    pub source_uri: String,
    /// 期望的文件名，缺省时从源地址推断
    #[serde(default)]
    pub file_name: Option<String>,
    /// 保存目录（绝对路径），缺省时依次使用默认目录、最近使用目录、配置的下载目录
    #[serde(default)]
    pub save_dir: Option<String>,
}

/// 批量操作结果
#[derive(Debug, Serialize)]
pub struct BulkResult {
    /// 成功处理的任务数
    pub affected: usize,
}

/// GET /api/v1/tasks?search=xxx
/// 列出任务
pub async fn list_tasks(
    State(app_state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ApiResponse<Vec<TaskSnapshot>>>, StatusCode> {
    match app_state.registry.list_tasks(&query.search).await {
        Ok(view) => Ok(Json(ApiResponse::success(
            view.iter().map(TaskHandle::snapshot).collect(),
        ))),
        Err(e) => {
            error!("列出任务失败: {}", e);
            Ok(Json(ApiResponse::from_registry_error(&e)))
        }
    }
}

/// GET /api/v1/tasks/:id
/// 获取单个任务
pub async fn get_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    let snapshot = app_state
        .registry
        .task_snapshot(&task_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// POST /api/v1/tasks
/// 添加下载任务
pub async fn add_task(
    State(app_state): State<AppState>,
    Json(req): Json<AddTaskRequest>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    let file_name = req
        .file_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| file_name_from_uri(&req.source_uri))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

    let folder = match app_state.resolve_save_folder(req.save_dir.as_deref()).await {
        Ok(folder) => folder,
        Err(e) => {
            warn!("保存目录无效: {:#}", e);
            return Ok(Json(ApiResponse::error(400, format!("{:#}", e))));
        }
    };

    info!(
        "API: 添加任务 源={}, 文件名={}, 目录={:?}",
        req.source_uri,
        file_name,
        folder.path()
    );

    match app_state
        .registry
        .add_task(&req.source_uri, &file_name, &folder)
        .await
    {
        Ok(task) => Ok(Json(ApiResponse::success(task.snapshot()))),
        Err(e) => {
            error!("添加任务失败: {}", e);
            Ok(Json(ApiResponse::from_registry_error(&e)))
        }
    }
}

/// DELETE /api/v1/tasks/:id
/// 移除任务
pub async fn remove_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    let task = app_state
        .registry
        .find_task(&task_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    match app_state.registry.remove_task(&task).await {
        Ok(()) => Ok(Json(ApiResponse::success(task_id))),
        Err(e) => {
            error!("移除任务失败: {}", e);
            Ok(Json(ApiResponse::from_registry_error(&e)))
        }
    }
}

/// POST /api/v1/tasks/:id/pause
pub async fn pause_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    let result = app_state.registry.pause_task(&task_id).await;
    command_response("pause", result)
}

/// POST /api/v1/tasks/:id/resume
pub async fn resume_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    let result = app_state.registry.resume_task(&task_id).await;
    command_response("resume", result)
}

/// POST /api/v1/tasks/:id/cancel
pub async fn cancel_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    let result = app_state.registry.cancel_task(&task_id).await;
    command_response("cancel", result)
}

/// 命令在登记器锁内执行并写回，这里只负责转换响应
fn command_response(
    command: &str,
    result: Result<Option<TaskHandle>, RegistryError>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    match result {
        Ok(Some(task)) => Ok(Json(ApiResponse::success(task.snapshot()))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("任务命令 {} 失败: {}", command, e);
            Ok(Json(ApiResponse::from_registry_error(&e)))
        }
    }
}

/// POST /api/v1/tasks/start-all
pub async fn start_all(State(app_state): State<AppState>) -> Json<ApiResponse<BulkResult>> {
    let affected = app_state.registry.start_all().await;
    Json(ApiResponse::success(BulkResult { affected }))
}

/// POST /api/v1/tasks/pause-all
pub async fn pause_all(State(app_state): State<AppState>) -> Json<ApiResponse<BulkResult>> {
    let affected = app_state.registry.pause_all().await;
    Json(ApiResponse::success(BulkResult { affected }))
}

/// DELETE /api/v1/tasks/finished
/// 清除所有已结束的任务
pub async fn clear_finished(State(app_state): State<AppState>) -> Json<ApiResponse<BulkResult>> {
    let affected = app_state.registry.clear_finished().await;
    Json(ApiResponse::success(BulkResult { affected }))
}
