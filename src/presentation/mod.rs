//! 表示层模块
//!
//! 负责HTTP请求处理、路由和应用状态

pub mod dto;
pub mod handlers;
pub mod routes;

// 重新导出路由创建函数
pub use routes::{create_routes, AppState};
