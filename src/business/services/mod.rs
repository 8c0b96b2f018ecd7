//! 业务服务模块
//!
//! 模型解析、会话管理、熔断保护和请求转发

pub mod circuit_breaker;
pub mod forwarder;
pub mod model_resolver;
pub mod session_store;
pub mod similarity;

// 重新导出常用类型
pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerSettings, CircuitBreakerState};
pub use forwarder::{RelayMode, RequestForwarder};
pub use model_resolver::ModelResolver;
pub use session_store::SessionStore;
