//! 常量定义模块

/// 市场相关常量
pub mod marketplace {
    pub const DEFAULT_BASE_URL: &str = "http://marketplace:9000";
    pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
    pub const MODELS_PATH: &str = "/blockchain/models";
    pub const MODELS_QUERY: &str = "limit=100&order=desc";
    /// 转发给上游的会话头（下划线写法为规范写法）
    pub const SESSION_HEADER: &str = "session_id";
}

/// 会话相关常量
pub mod session {
    pub const DEFAULT_EXPIRATION_SECONDS: u64 = 1800; // 30分钟
    pub const MIN_EXPIRATION_SECONDS: u64 = 60;
    pub const DEFAULT_SESSION_DURATION_SECONDS: u64 = 3600;
    pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300; // 5分钟
    pub const MAX_CREATE_ATTEMPTS: u32 = 3;
    pub const CREATE_RETRY_BASE_DELAY_MS: u64 = 1000;
}

/// 模型解析相关常量
pub mod model {
    pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600; // 1小时
    pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.3;
}

/// 熔断器相关常量
pub mod circuit_breaker {
    pub const MAX_HALF_OPEN_REQUESTS: u32 = 3;
    pub const WINDOW_SECONDS: u64 = 10;
    pub const COOLDOWN_SECONDS: u64 = 60;
    pub const MIN_REQUESTS: u32 = 5;
    pub const FAILURE_RATIO: f64 = 0.5;
}

/// HTTP相关常量
pub mod http {
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
    pub const STREAM_TIMEOUT_SECONDS: u64 = 300; // 5分钟
    pub const CONNECT_TIMEOUT_SECONDS: u64 = 10;
}
