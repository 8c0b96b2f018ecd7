//! 路由配置模块
//!
//! 应用状态的组装、生命周期管理以及HTTP路由

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::business::services::{
    CircuitBreaker, CircuitBreakerSettings, ModelResolver, RequestForwarder, SessionStore,
};
use crate::infrastructure::{create_http_client, Config, HttpMarketplaceClient, MarketplaceApi};
use crate::presentation::handlers;
use crate::shared::AppResult;

/// 应用状态
///
/// 持有解析器、会话存储、熔断器、转发器和后台清理任务
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub resolver: Arc<ModelResolver>,
    pub sessions: Arc<SessionStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub forwarder: Arc<RequestForwarder>,
    shutdown: CancellationToken,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    /// 初始化应用状态并启动后台清理任务（需要在Tokio运行时中调用）
    pub async fn init(config: Config) -> AppResult<Self> {
        let settings = config.circuit_breaker_settings();
        Self::init_with_breaker(config, settings).await
    }

    /// 使用自定义熔断参数初始化
    pub async fn init_with_breaker(config: Config, breaker_settings: CircuitBreakerSettings) -> AppResult<Self> {
        let http_client = create_http_client()?;
        let marketplace: Arc<dyn MarketplaceApi> =
            Arc::new(HttpMarketplaceClient::new(http_client.clone(), &config.marketplace));

        let resolver = Arc::new(ModelResolver::new(
            marketplace.clone(),
            config.model.cache_ttl_seconds,
            config.model.match_threshold,
        ));
        let sessions = Arc::new(SessionStore::new(marketplace, &config.session));
        let breaker = Arc::new(CircuitBreaker::new(breaker_settings));
        let forwarder = Arc::new(RequestForwarder::new(
            http_client.clone(),
            &config.marketplace,
            config.forwarding.clone(),
            sessions.clone(),
            breaker.clone(),
        ));

        let shutdown = CancellationToken::new();
        let tasks = vec![
            sessions
                .clone()
                .spawn_sweep(config.session.sweep_interval(), shutdown.clone()),
            resolver
                .clone()
                .spawn_purge(config.session.sweep_interval(), shutdown.clone()),
        ];

        info!(
            "✅ 应用状态初始化完成: 市场 {}, 会话过期 {}s, 单飞 {}",
            config.marketplace.base_url, config.session.expiration_seconds, config.session.single_flight
        );

        Ok(Self {
            config: Arc::new(config),
            http_client,
            resolver,
            sessions,
            breaker,
            forwarder,
            shutdown,
            background_tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    /// 清空缓存、会话并重置熔断器
    pub async fn reset(&self) {
        self.resolver.clear().await;
        self.sessions.clear().await;
        self.breaker.reset();
        info!("🔄 应用状态已重置");
    }

    /// 停止后台任务
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = match self.background_tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("⚠️ 等待后台清理任务退出超时");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// 创建应用路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/v1/chat/completions", post(handlers::proxy::chat_completions))
        .route("/v1/models", get(handlers::models::list_models))
        .route("/blockchain/models", get(handlers::passthrough::passthrough))
        .route("/blockchain/models/*rest", get(handlers::passthrough::passthrough))
        .with_state(state)
        // 全局中间件
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
