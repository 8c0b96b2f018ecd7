//! 业务逻辑层模块
//!
//! 包含领域模型和核心业务服务

pub mod domain;
pub mod services;

// 重新导出常用类型
pub use domain::*;
pub use services::*;
