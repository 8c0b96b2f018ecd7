//! 市场模型接口透传
//!
//! `/blockchain/models` 下的GET请求原样转发给市场，响应按原始字节回传

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
};
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::presentation::routes::AppState;
use crate::shared::{AppError, AppResult};
use crate::internal_error;

/// 不透传的请求/响应头部
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

fn should_pass(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !SKIPPED_HEADERS.contains(&lower.as_str())
}

/// GET /blockchain/models 及其子路径
#[instrument(skip(state, headers))]
pub async fn passthrough(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> AppResult<Response> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!("{}{}", state.config.marketplace.base_url, path_and_query);
    debug!("🔁 透传请求: {}", url);

    let mut request = state
        .http_client
        .get(&url)
        .timeout(Duration::from_secs(state.config.marketplace.timeout_seconds));
    for (name, value) in headers.iter() {
        if should_pass(name.as_str()) {
            request = request.header(name.as_str(), value.as_bytes());
        }
    }

    let response = request.send().await.map_err(|e| {
        error!("❌ 透传请求失败: {}", e);
        AppError::Upstream("Failed to forward request".to_string())
    })?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| internal_error!("无效的上游状态码: {}", e))?;
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if should_pass(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }

    let body = response.bytes().await.map_err(|e| {
        error!("❌ 读取透传响应失败: {}", e);
        AppError::Upstream("Failed to forward request".to_string())
    })?;

    builder
        .body(Body::from(body))
        .map_err(|e| internal_error!("构建透传响应失败: {}", e))
}
