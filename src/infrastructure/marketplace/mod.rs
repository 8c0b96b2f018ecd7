//! 市场API客户端
//!
//! 封装对市场模型目录、会话创建接口的调用，以及共享HTTP客户端的构建

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::business::domain::{
    CreateSessionRequest, CreateSessionResponse, ModelCatalog, ModelCatalogEntry,
};
use crate::infrastructure::config::MarketplaceConfig;
use crate::shared::constants::{http, marketplace};
use crate::shared::utils::truncate_for_log;
use crate::shared::{AppError, AppResult};
use crate::upstream_error;

/// 市场API接口
///
/// 模型解析器和会话存储只依赖该接口，便于在测试中替换
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// 拉取完整模型目录
    async fn fetch_models(&self) -> AppResult<Vec<ModelCatalogEntry>>;

    /// 为模型ID创建会话，返回会话ID
    async fn create_session(&self, model_id: &str, session_duration: u64) -> AppResult<String>;
}

/// 创建共享HTTP客户端
///
/// 不设置整体超时，每个请求按自己的场景单独设置
pub fn create_http_client() -> AppResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(http::CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| {
            error!("❌ 创建HTTP客户端失败: {}", e);
            AppError::Configuration(format!("创建HTTP客户端失败: {}", e))
        })
}

/// 基于 reqwest 的市场客户端
#[derive(Clone)]
pub struct HttpMarketplaceClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpMarketplaceClient {
    pub fn new(client: Client, config: &MarketplaceConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn models_url(&self) -> String {
        format!("{}{}?{}", self.base_url, marketplace::MODELS_PATH, marketplace::MODELS_QUERY)
    }

    pub fn session_url(&self, model_id: &str) -> String {
        format!("{}{}/{}/session", self.base_url, marketplace::MODELS_PATH, model_id)
    }
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceClient {
    #[instrument(skip(self))]
    async fn fetch_models(&self) -> AppResult<Vec<ModelCatalogEntry>> {
        let url = self.models_url();
        debug!("📋 拉取模型目录: {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| upstream_error!("拉取模型目录失败: {}", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| upstream_error!("读取模型目录响应失败: {}", e))?;

        if !status.is_success() {
            error!("❌ 模型目录返回错误状态 {}: {}", status, truncate_for_log(&body, 500));
            return Err(upstream_error!("模型目录返回错误状态 {}: {}", status.as_u16(), body));
        }

        let catalog: ModelCatalog = serde_json::from_str(&body)
            .map_err(|e| upstream_error!("解析模型目录失败: {}", e))?;

        info!("📋 模型目录包含 {} 个模型", catalog.models.len());
        for model in &catalog.models {
            debug!("  - {} (ID: {})", model.name, model.id);
        }

        Ok(catalog.models)
    }

    #[instrument(skip(self))]
    async fn create_session(&self, model_id: &str, session_duration: u64) -> AppResult<String> {
        let url = self.session_url(model_id);
        let body = CreateSessionRequest {
            session_duration,
            failover: false,
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream_error!("建立会话请求失败: {}", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| upstream_error!("读取会话响应失败: {}", e))?;

        if !status.is_success() {
            error!("❌ 会话接口返回错误状态 {}: {}", status, truncate_for_log(&text, 500));
            return Err(upstream_error!("建立会话失败: {}", text));
        }

        let parsed: CreateSessionResponse = serde_json::from_str(&text)
            .map_err(|e| upstream_error!("解析会话响应失败: {}", e))?;

        if parsed.session_id.is_empty() {
            return Err(upstream_error!("会话响应中没有有效的 sessionID"));
        }

        Ok(parsed.session_id)
    }
}
