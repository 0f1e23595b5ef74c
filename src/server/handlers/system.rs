// 带宽与版本API处理器

use crate::registry::TaskRegistry;
use crate::server::AppState;
use axum::{extract::State, response::Json};
use serde::Serialize;

use super::ApiResponse;

/// 总带宽 (bytes/s)
#[derive(Debug, Serialize)]
pub struct BandwidthInfo {
    pub download: u64,
    pub upload: u64,
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub service: String,
    pub version: String,
}

/// GET /api/v1/bandwidth
pub async fn get_bandwidth(State(app_state): State<AppState>) -> Json<ApiResponse<BandwidthInfo>> {
    Json(ApiResponse::success(BandwidthInfo {
        download: app_state.registry.total_download_bandwidth(),
        upload: app_state.registry.total_upload_bandwidth(),
    }))
}

/// GET /api/v1/version
pub async fn get_version() -> Json<ApiResponse<VersionInfo>> {
    Json(ApiResponse::success(VersionInfo {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: TaskRegistry::version().to_string(),
    }))
}
