//! 模型列表相关的DTO

use serde::Serialize;

use crate::business::domain::ModelCatalogEntry;

/// OpenAI 兼容的模型列表
#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

impl ModelListResponse {
    pub fn new(data: Vec<ModelInfo>) -> Self {
        Self { object: "list", data }
    }
}

/// 模型信息，`id` 使用目录中的规范名称，客户端可直接作为 `model` 传入
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub model_id: String,
}

impl From<ModelCatalogEntry> for ModelInfo {
    fn from(entry: ModelCatalogEntry) -> Self {
        Self {
            id: entry.name,
            object: "model",
            owned_by: "marketplace",
            model_id: entry.id,
        }
    }
}
