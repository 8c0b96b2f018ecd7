//! 领域模型
//!
//! 模型目录、模型缓存条目、会话以及聊天补全请求

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::AppResult;
use crate::validation_error;

/// 市场目录中的模型条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// 市场模型目录响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub models: Vec<ModelCatalogEntry>,
}

/// 模型名称解析缓存条目，以请求中的原始模型名为键
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCacheEntry {
    pub model_id: String,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
}

impl ModelCacheEntry {
    pub fn new(model_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            model_name: model_name.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at < ttl
    }
}

/// 针对某个模型ID的限时会话
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub model_id: String,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        model_id: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: model_id.into(),
            model_name: model_name.into(),
            created_at: Utc::now(),
        }
    }

    /// 会话是否仍在有效期内
    pub fn is_valid(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at < expiration
    }
}

/// 创建会话请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_duration: u64,
    pub failover: bool,
}

/// 创建会话响应体
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
}

/// OpenAI 兼容的聊天补全请求
///
/// 只解析网关关心的字段，其余字段原样透传给上游
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    /// 从原始请求体解析
    ///
    /// `model` 缺失或不是字符串时报 "model field is required"，
    /// 其余字段类型不符（如 `stream` 不是布尔值）时报 "Invalid request body"
    pub fn from_value(value: serde_json::Value) -> AppResult<Self> {
        let model_is_string = value.get("model").map_or(false, |m| m.is_string());
        if !model_is_string {
            return Err(validation_error!("model field is required"));
        }
        serde_json::from_value(value).map_err(|e| {
            tracing::debug!("请求体字段类型不符: {}", e);
            validation_error!("Invalid request body")
        })
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_catalog_wire_format() {
        let catalog: ModelCatalog = serde_json::from_value(json!({
            "models": [{"Id": "model1", "Name": "GPT-4"}]
        }))
        .unwrap();
        assert_eq!(catalog.models[0].id, "model1");
        assert_eq!(catalog.models[0].name, "GPT-4");
    }

    #[test]
    fn test_create_session_wire_format() {
        let body = serde_json::to_value(CreateSessionRequest {
            session_duration: 3600,
            failover: false,
        })
        .unwrap();
        assert_eq!(body, json!({"sessionDuration": 3600, "failover": false}));

        let resp: CreateSessionResponse =
            serde_json::from_value(json!({"sessionID": "abc"})).unwrap();
        assert_eq!(resp.session_id, "abc");
    }

    #[test]
    fn test_session_validity() {
        let mut session = Session::new("s1", "m1", "Model");
        let now = Utc::now();
        assert!(session.is_valid(Duration::seconds(60), now));

        session.created_at = now - Duration::seconds(120);
        assert!(!session.is_valid(Duration::seconds(60), now));
    }

    #[test]
    fn test_chat_request_preserves_extra_fields() {
        let request = ChatCompletionRequest::from_value(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2
        }))
        .unwrap();
        assert!(!request.is_streaming());

        let out = serde_json::to_value(&request).unwrap();
        assert_eq!(out["temperature"], 0.2);
        assert!(out.get("stream").is_none());
    }

    #[test]
    fn test_chat_request_requires_string_model() {
        let err = ChatCompletionRequest::from_value(json!({"messages": []})).unwrap_err();
        assert_eq!(err.client_message(), "model field is required");
        let err = ChatCompletionRequest::from_value(json!({"model": 42})).unwrap_err();
        assert_eq!(err.client_message(), "model field is required");
    }

    #[test]
    fn test_chat_request_rejects_mistyped_fields() {
        let err = ChatCompletionRequest::from_value(json!({"model": "gpt-4", "stream": "yes"})).unwrap_err();
        assert_eq!(err.client_message(), "Invalid request body");
        let err = ChatCompletionRequest::from_value(json!({"model": "gpt-4", "messages": "hi"})).unwrap_err();
        assert_eq!(err.client_message(), "Invalid request body");
    }
}
