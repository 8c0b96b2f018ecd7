//! Marketplace Gateway 服务
//!
//! OpenAI 兼容的聊天补全网关：解析模型名称、管理市场会话，
//! 并通过熔断器将请求转发给市场，基于三层架构设计

// 核心模块
pub mod shared;          // 共享模块（错误处理、常量、工具函数）
pub mod infrastructure;  // 基础设施层（配置、市场API客户端）
pub mod business;        // 业务逻辑层（领域模型、模型解析、会话、转发）
pub mod presentation;    // 表示层（HTTP处理、路由、应用状态）

// 重新导出核心类型
pub use infrastructure::Config;
pub use presentation::{create_routes, AppState};
pub use shared::{AppError, AppResult};
