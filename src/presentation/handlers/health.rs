//! 健康检查处理器

use axum::response::Json;
use serde_json::{json, Value};
use tracing::debug;

/// 基础健康检查
pub async fn health_check() -> Json<Value> {
    debug!("🏥 健康检查请求");
    Json(json!({ "status": "healthy" }))
}
