//! 模型列表处理器

use axum::{extract::State, response::Json};
use tracing::{info, instrument};

use crate::presentation::dto::models::{ModelInfo, ModelListResponse};
use crate::presentation::routes::AppState;
use crate::shared::{AppError, AppResult};

/// GET /v1/models
///
/// 以OpenAI格式列出市场目录中的模型
#[instrument(skip(state))]
pub async fn list_models(State(state): State<AppState>) -> AppResult<Json<ModelListResponse>> {
    let catalog = state.resolver.catalog().await.map_err(|e| {
        tracing::error!("❌ 获取模型目录失败: {}", e);
        AppError::Upstream("Failed to fetch models".to_string())
    })?;

    info!("📋 返回 {} 个模型", catalog.len());
    Ok(Json(ModelListResponse::new(
        catalog.into_iter().map(ModelInfo::from).collect(),
    )))
}
