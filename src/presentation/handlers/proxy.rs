//! 聊天补全代理处理器
//!
//! 解析请求中的模型名称，确保会话可用后转发给市场

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Response,
};
use tracing::{debug, error, info, instrument, warn};

use crate::business::domain::{ChatCompletionRequest, Session};
use crate::presentation::routes::AppState;
use crate::shared::constants::marketplace::SESSION_HEADER;
use crate::shared::utils::{generate_request_id, truncate_for_log};
use crate::shared::{AppError, AppResult};
use crate::validation_error;

const FORWARD_FAILED: &str = "Failed to forward request";
const SESSION_FAILED: &str = "Failed to establish session";

/// POST /v1/chat/completions
#[instrument(skip(state, headers, body), fields(request_id = tracing::field::Empty))]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request_id = generate_request_id();
    tracing::Span::current().record("request_id", request_id.as_str());

    debug!(
        "📨 [{}] 收到聊天请求: {}",
        request_id,
        truncate_for_log(&String::from_utf8_lossy(&body), 1000)
    );

    let value: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
        warn!("⚠️ [{}] 请求体解析失败: {}", request_id, e);
        validation_error!("Invalid request body")
    })?;
    if !value.is_object() {
        return Err(validation_error!("Invalid request body"));
    }

    let request = ChatCompletionRequest::from_value(value)?;

    let session = match fast_path_session(&state, &headers).await {
        Some(session) => {
            info!(
                "⚡ [{}] 复用请求头中的会话 {} (模型 {})",
                request_id, session.session_id, session.model_id
            );
            session
        }
        None => {
            let model = state.resolver.resolve_entry(&request.model).await?;
            state
                .sessions
                .ensure(&model.model_id, &model.model_name)
                .await
                .map_err(|e| {
                    error!("❌ [{}] 会话建立失败: {}", request_id, e);
                    AppError::Session(SESSION_FAILED.to_string())
                })?
        }
    };

    let mode = state.forwarder.relay_mode(&request);
    info!(
        "🔀 [{}] 模型 '{}' -> {} ({:?})",
        request_id, request.model, session.model_id, mode
    );

    state
        .forwarder
        .forward(request, &session.model_id, mode, &request_id)
        .await
        .map_err(|e| match e {
            AppError::Upstream(cause) => {
                error!("❌ [{}] 转发失败: {}", request_id, cause);
                AppError::Upstream(format!("{}: {}", FORWARD_FAILED, cause))
            }
            other => other,
        })
}

/// 请求头中的 session_id 命中有效会话时，滑动续期并直接使用
async fn fast_path_session(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;

    let session = state.sessions.find_by_session_id(session_id).await?;
    state.sessions.touch(&session.model_id).await
}
