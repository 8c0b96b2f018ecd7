//! 统一错误处理模块
//!
//! 定义网关中所有错误类型，并统一映射为 `{"error": "<message>"}` 响应

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// 模型解析失败时返回给客户端的固定消息
pub const NO_MODEL_REGISTERED: &str = "No Supported Model Has Been Registered";

/// 应用程序统一错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 请求校验错误（缺少 model 字段、空模型名等）
    #[error("验证错误: {0}")]
    Validation(String),

    /// 模型解析错误
    #[error("模型解析错误: {0}")]
    Resolution(String),

    /// 会话建立错误
    #[error("会话错误: {0}")]
    Session(String),

    /// 上游市场错误（非200响应、熔断器开启、网络/超时）
    #[error("上游服务错误: {0}")]
    Upstream(String),

    /// 传输层无法增量刷新
    #[error("不支持流式响应: {0}")]
    StreamingUnsupported(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 内部服务器错误
    #[error("内部错误: {0}")]
    Internal(String),
}

impl AppError {
    /// 模型未注册错误
    pub fn no_model_registered() -> Self {
        AppError::Resolution(NO_MODEL_REGISTERED.to_string())
    }

    /// 获取HTTP状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Resolution(_) => StatusCode::BAD_REQUEST,
            AppError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::StreamingUnsupported(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Resolution(_) => "RESOLUTION_ERROR",
            AppError::Session(_) => "SESSION_ERROR",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::StreamingUnsupported(_) => "STREAMING_UNSUPPORTED",
            AppError::Configuration(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 返回给客户端的消息（不带分类前缀）
    pub fn client_message(&self) -> &str {
        match self {
            AppError::Validation(msg)
            | AppError::Resolution(msg)
            | AppError::Session(msg)
            | AppError::Upstream(msg)
            | AppError::StreamingUnsupported(msg)
            | AppError::Configuration(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_code = self.error_code();

        tracing::error!(
            status = ?status_code,
            error_code = error_code,
            error = %self,
            "处理请求时发生错误"
        );

        let body = Json(json!({
            "error": self.client_message(),
        }));

        (status_code, body).into_response()
    }
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

/// 上游错误构造宏
#[macro_export]
macro_rules! upstream_error {
    ($msg:expr) => {
        $crate::shared::error::AppError::Upstream($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::shared::error::AppError::Upstream(format!($fmt, $($arg)*))
    };
}

/// 验证错误构造宏
#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::shared::error::AppError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::shared::error::AppError::Validation(format!($fmt, $($arg)*))
    };
}

/// 内部错误构造宏
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::shared::error::AppError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::shared::error::AppError::Internal(format!($fmt, $($arg)*))
    };
}
