// Web服务器模块

pub mod handlers;
pub mod state;
pub mod websocket;

pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 健康检查响应
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

/// 按配置的允许源构建 CORS 层，包含 `*` 时允许任意源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的 CORS 源 {}: {}", origin, e);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// 构建完整路由
pub async fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.read().await.server.cors_origins);
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let api_routes = Router::new()
        // 任务
        .route("/tasks", get(handlers::list_tasks).post(handlers::add_task))
        .route("/tasks/start-all", post(handlers::start_all))
        .route("/tasks/pause-all", post(handlers::pause_all))
        .route(
            "/tasks/finished",
            axum::routing::delete(handlers::clear_finished),
        )
        .route(
            "/tasks/:id",
            get(handlers::get_task).delete(handlers::remove_task),
        )
        .route("/tasks/:id/pause", post(handlers::pause_task))
        .route("/tasks/:id/resume", post(handlers::resume_task))
        .route("/tasks/:id/cancel", post(handlers::cancel_task))
        // 目录
        .route(
            "/folders/default",
            get(handlers::get_folders).put(handlers::set_default_folder),
        )
        // 带宽与版本
        .route("/bandwidth", get(handlers::get_bandwidth))
        .route("/version", get(handlers::get_version))
        // 事件推送
        .route("/ws", get(websocket::handle_websocket))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}
