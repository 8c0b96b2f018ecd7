//! 基础设施层模块
//!
//! 负责配置管理和对市场API的外部调用

pub mod config;
pub mod marketplace;

// 重新导出常用类型
pub use config::Config;
pub use marketplace::{create_http_client, HttpMarketplaceClient, MarketplaceApi};
