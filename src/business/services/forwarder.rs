//! 请求转发服务
//!
//! 将聊天补全请求带上会话头转发给市场，并按批量或流式方式回传响应。
//! 所有上游调用都经过熔断器。

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::business::domain::ChatCompletionRequest;
use crate::business::services::circuit_breaker::CircuitBreaker;
use crate::business::services::session_store::SessionStore;
use crate::infrastructure::config::{ForwardingConfig, MarketplaceConfig, ModelRewrite};
use crate::shared::constants::marketplace::SESSION_HEADER;
use crate::shared::utils::{format_duration_ms, truncate_for_log};
use crate::shared::{AppError, AppResult};
use crate::{internal_error, upstream_error};

/// 批量回传时不转发的逐跳头部
const HOP_BY_HOP_HEADERS: &[&str] = &["transfer-encoding", "connection", "keep-alive", "content-length"];

const DONE_LINE: &str = "data: [DONE]";

/// 响应回传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Batch,
    Stream,
}

/// 请求转发器
pub struct RequestForwarder {
    client: Client,
    chat_url: String,
    sessions: Arc<SessionStore>,
    breaker: Arc<CircuitBreaker>,
    forwarding: ForwardingConfig,
    timeout: Duration,
    stream_timeout: Duration,
}

impl RequestForwarder {
    pub fn new(
        client: Client,
        marketplace: &MarketplaceConfig,
        forwarding: ForwardingConfig,
        sessions: Arc<SessionStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client,
            chat_url: marketplace.chat_url.clone(),
            sessions,
            breaker,
            forwarding,
            timeout: Duration::from_secs(marketplace.timeout_seconds),
            stream_timeout: Duration::from_secs(marketplace.stream_timeout_seconds),
        }
    }

    /// 根据客户端请求和强制流式开关决定回传方式
    pub fn relay_mode(&self, request: &ChatCompletionRequest) -> RelayMode {
        if request.is_streaming() || self.forwarding.force_upstream_stream {
            RelayMode::Stream
        } else {
            RelayMode::Batch
        }
    }

    /// 转发请求
    ///
    /// 调用方必须先为 `model_id` 建立会话
    pub async fn forward(
        &self,
        mut request: ChatCompletionRequest,
        model_id: &str,
        mode: RelayMode,
        request_id: &str,
    ) -> AppResult<Response> {
        if mode == RelayMode::Stream && !self.forwarding.enable_streaming {
            return Err(AppError::StreamingUnsupported(
                "Streaming unsupported".to_string(),
            ));
        }

        let session = self.sessions.get(model_id).await.ok_or_else(|| {
            error!("❌ [{}] 模型 {} 没有可用会话", request_id, model_id);
            AppError::Session(format!("模型 {} 没有可用会话", model_id))
        })?;

        request.model = match self.forwarding.model_rewrite {
            ModelRewrite::Id => session.model_id.clone(),
            ModelRewrite::Name => session.model_name.clone(),
        };
        if mode == RelayMode::Stream && self.forwarding.force_upstream_stream {
            request.stream = Some(true);
        }

        let timeout = match mode {
            RelayMode::Batch => self.timeout,
            RelayMode::Stream => self.stream_timeout,
        };

        info!(
            "📤 [{}] 转发到 {} (模型 {}, 会话 {}, {:?})",
            request_id, self.chat_url, request.model, session.session_id, mode
        );

        // 请求future在上报前被取消时，许可在drop中按失败结算
        let permit = self.breaker.allow_request()?;

        let start = Instant::now();
        let response = match self
            .client
            .post(&self.chat_url)
            .header("content-type", "application/json")
            .header(SESSION_HEADER, &session.session_id)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                permit.record_failure();
                if e.is_timeout() {
                    error!("⏰ [{}] 上游请求超时 ({:?}): {}", request_id, timeout, e);
                    return Err(upstream_error!("上游请求超时: {}", e));
                }
                error!("❌ [{}] 上游请求失败: {}", request_id, e);
                return Err(upstream_error!("上游请求失败: {}", e));
            }
        };

        let status = response.status();
        if status.is_server_error() {
            permit.record_failure();
        } else {
            permit.record_success();
        }

        info!(
            "📥 [{}] 上游响应 {} ({})",
            request_id,
            status,
            format_duration_ms(start.elapsed().as_millis() as u64)
        );

        match mode {
            RelayMode::Batch => relay_batch(response, request_id).await,
            RelayMode::Stream => relay_stream(response, request_id).await,
        }
    }
}

/// 原样回传状态码、头部和响应体
async fn relay_batch(response: reqwest::Response, request_id: &str) -> AppResult<Response> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| internal_error!("无效的上游状态码: {}", e))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if should_forward_header(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| upstream_error!("读取上游响应失败: {}", e))?;

    if !status.is_success() {
        warn!(
            "⚠️ [{}] 上游返回 {}: {}",
            request_id,
            status,
            truncate_for_log(&String::from_utf8_lossy(&body), 500)
        );
    }

    builder
        .body(Body::from(body))
        .map_err(|e| internal_error!("构建响应失败: {}", e))
}

/// 以SSE方式逐行回传
async fn relay_stream(response: reqwest::Response, request_id: &str) -> AppResult<Response> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        error!(
            "❌ [{}] 流式上游返回 {}: {}",
            request_id,
            status,
            truncate_for_log(&body, 500)
        );
        return Err(upstream_error!("上游返回错误状态 {}: {}", status.as_u16(), body));
    }

    debug!("🌊 [{}] 开始流式回传", request_id);
    let lines = frame_lines(Box::pin(response.bytes_stream()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(HeaderName::from_static("connection"), HeaderValue::from_static("keep-alive"))
        .body(Body::from_stream(lines))
        .map_err(|e| internal_error!("构建流式响应失败: {}", e))
}

fn should_forward_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

fn is_done_line(line: &[u8]) -> bool {
    std::str::from_utf8(line).map_or(false, |s| s.trim_end_matches(['\r', '\n']) == DONE_LINE)
}

struct LineFramer<S> {
    upstream: S,
    buffer: Vec<u8>,
    finished: bool,
}

/// 将上游字节流重新按行切分，每行（含换行符）单独交给客户端
///
/// 上游结束或遇到 `data: [DONE]` 时停止
pub fn frame_lines<S, E>(upstream: S) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: std::fmt::Display + Send,
{
    let state = LineFramer {
        upstream,
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                if is_done_line(&line) {
                    state.finished = true;
                }
                return Some((Ok(Bytes::from(line)), state));
            }

            match state.upstream.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    warn!("⚠️ 读取上游流失败: {}", e);
                    let err = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let rest = std::mem::take(&mut state.buffer);
                    return Some((Ok(Bytes::from(rest)), state));
                }
            }
        }
    })
}
