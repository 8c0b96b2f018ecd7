use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::business::services::circuit_breaker::CircuitBreakerSettings;
use crate::shared::constants::{http, marketplace, model, session};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub marketplace: MarketplaceConfig,
    pub session: SessionConfig,
    pub model: ModelConfig,
    pub forwarding: ForwardingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// 市场API根地址（目录、会话、透传）
    pub base_url: String,
    /// 聊天补全完整地址
    pub chat_url: String,
    pub timeout_seconds: u64,
    pub stream_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub expiration_seconds: u64,
    pub session_duration_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub max_create_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub single_flight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub cache_ttl_seconds: u64,
    pub match_threshold: f64,
}

/// 转发给上游时 `model` 字段的改写方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRewrite {
    /// 改写为解析后的模型ID
    Id,
    /// 改写为目录中的规范名称
    Name,
}

impl ModelRewrite {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "id" => Some(ModelRewrite::Id),
            "name" => Some(ModelRewrite::Name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    pub model_rewrite: ModelRewrite,
    /// 无论客户端是否请求流式，都以流式方式调用上游
    pub force_upstream_stream: bool,
    pub enable_streaming: bool,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // 从环境变量加载配置
        dotenv::dotenv().ok();

        let base_url = env::var("MARKETPLACE_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| marketplace::DEFAULT_BASE_URL.to_string());
        let base_url = base_url.trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .map_err(|e| anyhow::anyhow!("MARKETPLACE_BASE_URL 无效 ({}): {}", base_url, e))?;

        let chat_url = env::var("MARKETPLACE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("{}{}", base_url, marketplace::CHAT_COMPLETIONS_PATH));
        url::Url::parse(&chat_url)
            .map_err(|e| anyhow::anyhow!("MARKETPLACE_URL 无效 ({}): {}", chat_url, e))?;

        let port = env::var("PORT")
            .ok()
            .or_else(|| env::var("DEFAULT_PORT").ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(http::DEFAULT_PORT);

        let model_rewrite = match env::var("MODEL_REWRITE") {
            Ok(v) => ModelRewrite::parse(&v).unwrap_or_else(|| {
                warn!("MODEL_REWRITE 取值无效: {}，使用默认值 id", v);
                ModelRewrite::Id
            }),
            Err(_) => ModelRewrite::Id,
        };

        let config = Config {
            server: ServerConfig {
                port,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },

            marketplace: MarketplaceConfig {
                base_url,
                chat_url,
                timeout_seconds: env_or("UPSTREAM_TIMEOUT_SECONDS", http::DEFAULT_TIMEOUT_SECONDS),
                stream_timeout_seconds: env_or("STREAM_TIMEOUT_SECONDS", http::STREAM_TIMEOUT_SECONDS),
            },

            session: SessionConfig {
                expiration_seconds: session_expiration_seconds(
                    env::var("SESSION_EXPIRATION_SECONDS").ok().as_deref(),
                ),
                session_duration_seconds: env_or(
                    "SESSION_DURATION_SECONDS",
                    session::DEFAULT_SESSION_DURATION_SECONDS,
                ),
                sweep_interval_seconds: env_or(
                    "SESSION_SWEEP_INTERVAL_SECONDS",
                    session::DEFAULT_SWEEP_INTERVAL_SECONDS,
                ),
                max_create_attempts: session::MAX_CREATE_ATTEMPTS,
                retry_base_delay_ms: session::CREATE_RETRY_BASE_DELAY_MS,
                single_flight: env_or("SESSION_SINGLE_FLIGHT", true),
            },

            model: ModelConfig {
                cache_ttl_seconds: env_or("MODEL_CACHE_TTL_SECONDS", model::DEFAULT_CACHE_TTL_SECONDS),
                match_threshold: env_or("MODEL_MATCH_THRESHOLD", model::DEFAULT_MATCH_THRESHOLD),
            },

            forwarding: ForwardingConfig {
                model_rewrite,
                force_upstream_stream: env_or("FORCE_UPSTREAM_STREAM", false),
                enable_streaming: env_or("ENABLE_STREAMING", true),
            },
        };

        Ok(config)
    }

    /// 以指定市场地址构建默认配置（不读取环境变量）
    pub fn for_marketplace(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            server: ServerConfig {
                port: http::DEFAULT_PORT,
                host: "0.0.0.0".to_string(),
            },
            marketplace: MarketplaceConfig {
                chat_url: format!("{}{}", base_url, marketplace::CHAT_COMPLETIONS_PATH),
                base_url,
                timeout_seconds: http::DEFAULT_TIMEOUT_SECONDS,
                stream_timeout_seconds: http::STREAM_TIMEOUT_SECONDS,
            },
            session: SessionConfig {
                expiration_seconds: session::DEFAULT_EXPIRATION_SECONDS,
                session_duration_seconds: session::DEFAULT_SESSION_DURATION_SECONDS,
                sweep_interval_seconds: session::DEFAULT_SWEEP_INTERVAL_SECONDS,
                max_create_attempts: session::MAX_CREATE_ATTEMPTS,
                retry_base_delay_ms: session::CREATE_RETRY_BASE_DELAY_MS,
                single_flight: true,
            },
            model: ModelConfig {
                cache_ttl_seconds: model::DEFAULT_CACHE_TTL_SECONDS,
                match_threshold: model::DEFAULT_MATCH_THRESHOLD,
            },
            forwarding: ForwardingConfig {
                model_rewrite: ModelRewrite::Id,
                force_upstream_stream: false,
                enable_streaming: true,
            },
        }
    }

    pub fn circuit_breaker_settings(&self) -> CircuitBreakerSettings {
        CircuitBreakerSettings::default()
    }
}

impl SessionConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// 解析会话过期秒数：缺失、非法或小于60秒时回退到默认值
pub fn session_expiration_seconds(raw: Option<&str>) -> u64 {
    match raw {
        None => session::DEFAULT_EXPIRATION_SECONDS,
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) if secs >= session::MIN_EXPIRATION_SECONDS => secs,
            _ => {
                warn!(
                    "SESSION_EXPIRATION_SECONDS 取值无效: {}，使用默认值 {}",
                    value,
                    session::DEFAULT_EXPIRATION_SECONDS
                );
                session::DEFAULT_EXPIRATION_SECONDS
            }
        },
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expiration_seconds() {
        assert_eq!(session_expiration_seconds(None), 1800);
        assert_eq!(session_expiration_seconds(Some("3600")), 3600);
        assert_eq!(session_expiration_seconds(Some("invalid")), 1800);
        assert_eq!(session_expiration_seconds(Some("30")), 1800);
        assert_eq!(session_expiration_seconds(Some("60")), 60);
    }

    #[test]
    fn test_model_rewrite_parse() {
        assert_eq!(ModelRewrite::parse("id"), Some(ModelRewrite::Id));
        assert_eq!(ModelRewrite::parse(" NAME "), Some(ModelRewrite::Name));
        assert_eq!(ModelRewrite::parse("other"), None);
    }

    #[test]
    fn test_for_marketplace_defaults() {
        let config = Config::for_marketplace("http://localhost:9000/");
        assert_eq!(config.marketplace.base_url, "http://localhost:9000");
        assert_eq!(config.marketplace.chat_url, "http://localhost:9000/v1/chat/completions");
        assert_eq!(config.session.expiration_seconds, 1800);
        assert!(config.session.single_flight);
        assert!(!config.forwarding.force_upstream_stream);
        assert_eq!(config.forwarding.model_rewrite, ModelRewrite::Id);
    }
}
