//! 集成测试公共工具：模拟市场服务和网关构建

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use marketplace_gateway::business::services::CircuitBreakerSettings;
use marketplace_gateway::{create_routes, AppState, Config};

pub const SSE_BODY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
data: [DONE]\n\n";

/// 慢速流式上游在第一帧之后的停顿
pub const STREAM_PAUSE: Duration = Duration::from_millis(800);

/// 记录的上游聊天请求
#[derive(Debug, Clone)]
pub struct RecordedChat {
    pub body: Value,
    pub session_id: Option<String>,
}

#[derive(Default)]
pub struct MockInner {
    pub catalog_calls: AtomicUsize,
    pub session_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub chat_status: AtomicU16,
    pub fail_sessions: AtomicBool,
    pub hang_chat: AtomicBool,
    pub slow_stream: AtomicBool,
    pub chats: Mutex<Vec<RecordedChat>>,
    pub passthrough_uris: Mutex<Vec<String>>,
}

/// 模拟市场服务
pub struct MockMarketplace {
    pub base_url: String,
    pub state: Arc<MockInner>,
}

impl MockMarketplace {
    pub async fn start() -> Self {
        let state = Arc::new(MockInner::default());
        state.chat_status.store(200, Ordering::SeqCst);

        let app = Router::new()
            .route("/blockchain/models", get(models))
            .route("/blockchain/models/:id", get(model_detail))
            .route("/blockchain/models/:id/session", post(create_session))
            .route("/v1/chat/completions", post(chat))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn catalog_calls(&self) -> usize {
        self.state.catalog_calls.load(Ordering::SeqCst)
    }

    pub fn session_calls(&self) -> usize {
        self.state.session_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.state.chat_calls.load(Ordering::SeqCst)
    }

    pub fn set_chat_status(&self, status: u16) {
        self.state.chat_status.store(status, Ordering::SeqCst);
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.state.fail_sessions.store(fail, Ordering::SeqCst);
    }

    /// 聊天接口收到请求后不再响应
    pub fn hang_chat(&self, hang: bool) {
        self.state.hang_chat.store(hang, Ordering::SeqCst);
    }

    /// 流式响应先发第一帧，停顿 `STREAM_PAUSE` 后再发送剩余内容
    pub fn slow_stream(&self, slow: bool) {
        self.state.slow_stream.store(slow, Ordering::SeqCst);
    }

    pub fn last_chat(&self) -> RecordedChat {
        self.state.chats.lock().unwrap().last().cloned().expect("没有记录到聊天请求")
    }

    pub fn passthrough_uris(&self) -> Vec<String> {
        self.state.passthrough_uris.lock().unwrap().clone()
    }

    /// 以测试友好的参数构建配置
    pub fn config(&self) -> Config {
        let mut config = Config::for_marketplace(&self.base_url);
        config.session.retry_base_delay_ms = 10;
        config.marketplace.timeout_seconds = 5;
        config.marketplace.stream_timeout_seconds = 5;
        config
    }
}

async fn models(State(state): State<Arc<MockInner>>, uri: Uri) -> Response {
    state.catalog_calls.fetch_add(1, Ordering::SeqCst);
    state.passthrough_uris.lock().unwrap().push(uri.to_string());
    (
        [("x-marketplace", "mock")],
        Json(json!({
            "models": [
                {"Id": "model1", "Name": "GPT-4"},
                {"Id": "model2", "Name": "GPT-3.5"}
            ]
        })),
    )
        .into_response()
}

async fn model_detail(State(state): State<Arc<MockInner>>, Path(id): Path<String>, uri: Uri) -> Response {
    state.passthrough_uris.lock().unwrap().push(uri.to_string());
    if id == "missing" {
        return (StatusCode::NOT_FOUND, "model not found").into_response();
    }
    Json(json!({"Id": id, "Name": "GPT-4"})).into_response()
}

async fn create_session(State(state): State<Arc<MockInner>>, Path(id): Path<String>, Json(body): Json<Value>) -> Response {
    let n = state.session_calls.fetch_add(1, Ordering::SeqCst) + 1;
    assert_eq!(body["sessionDuration"], 3600);
    assert_eq!(body["failover"], false);

    if state.fail_sessions.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "nonce too low").into_response();
    }
    Json(json!({"sessionID": format!("session-{}-{}", id, n)})).into_response()
}

async fn chat(State(state): State<Arc<MockInner>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.chat_calls.fetch_add(1, Ordering::SeqCst);
    let session_id = headers
        .get("session_id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let streaming = body["stream"].as_bool().unwrap_or(false);
    let model = body["model"].clone();
    state.chats.lock().unwrap().push(RecordedChat { body, session_id });

    if state.hang_chat.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }

    let status = state.chat_status.load(Ordering::SeqCst);
    if status != 200 {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, Json(json!({"error": "upstream boom"}))).into_response();
    }

    if streaming && state.slow_stream.load(Ordering::SeqCst) {
        let split = SSE_BODY.find("\n\n").unwrap() + 2;
        let (first, rest) = SSE_BODY.split_at(split);
        let chunks = futures::stream::iter(vec![(first, Duration::ZERO), (rest, STREAM_PAUSE)]).then(
            |(chunk, pause)| async move {
                tokio::time::sleep(pause).await;
                Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))
            },
        );
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap();
    }

    if streaming {
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from(SSE_BODY))
            .unwrap();
    }

    (
        [("x-upstream", "mock")],
        Json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello world"}}]
        })),
    )
        .into_response()
}

/// 测试网关
pub struct TestGateway {
    pub app: Router,
    pub state: AppState,
}

impl TestGateway {
    pub async fn start(config: Config) -> Self {
        Self::with_breaker(config, CircuitBreakerSettings::default()).await
    }

    pub async fn with_breaker(config: Config, settings: CircuitBreakerSettings) -> Self {
        let state = AppState::init_with_breaker(config, settings).await.unwrap();
        let app = create_routes(state.clone());
        Self { app, state }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = tokio::time::timeout(Duration::from_secs(10), to_bytes(response.into_body(), usize::MAX))
            .await
            .expect("读取响应体超时")
            .unwrap();
        (status, headers, body.to_vec())
    }

    pub async fn chat(&self, body: Value) -> (StatusCode, HeaderMap, Vec<u8>) {
        self.send(chat_request(body, None)).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }
}

pub fn chat_request(body: Value, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(id) = session_id {
        builder = builder.header("session_id", id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}
