//! 模型解析服务
//!
//! 将客户端传入的模型名称解析为市场模型ID：
//! - 先查带TTL的本地缓存
//! - 未命中时拉取市场目录，按子串匹配 + 相似度打分选出最佳模型
//! - 无子串匹配时退化为全量模糊匹配，要求分数超过阈值

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::business::domain::{ModelCacheEntry, ModelCatalogEntry};
use crate::business::services::similarity::similarity;
use crate::infrastructure::MarketplaceApi;
use crate::shared::{AppError, AppResult};
use crate::validation_error;

/// 模型解析器
pub struct ModelResolver {
    marketplace: Arc<dyn MarketplaceApi>,
    cache: RwLock<HashMap<String, ModelCacheEntry>>,
    cache_ttl: Duration,
    match_threshold: f64,
}

impl ModelResolver {
    pub fn new(marketplace: Arc<dyn MarketplaceApi>, cache_ttl_seconds: u64, match_threshold: f64) -> Self {
        Self {
            marketplace,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::seconds(cache_ttl_seconds as i64),
            match_threshold,
        }
    }

    /// 解析模型名称，返回模型ID
    pub async fn resolve(&self, handle: &str) -> AppResult<String> {
        self.resolve_entry(handle).await.map(|entry| entry.model_id)
    }

    /// 解析模型名称，返回包含规范名称的缓存条目
    #[instrument(skip(self))]
    pub async fn resolve_entry(&self, handle: &str) -> AppResult<ModelCacheEntry> {
        let normalized = handle.trim();
        if normalized.is_empty() {
            return Err(validation_error!("model field is required"));
        }

        if let Some(entry) = self.cached(handle).await {
            debug!("🎯 模型缓存命中: '{}' -> {}", handle, entry.model_id);
            return Ok(entry);
        }

        let models = match self.marketplace.fetch_models().await {
            Ok(models) => models,
            Err(e) => {
                warn!("⚠️ 拉取模型目录失败，无法解析 '{}': {}", handle, e);
                return Err(AppError::no_model_registered());
            }
        };

        if models.is_empty() {
            warn!("⚠️ 市场中没有注册任何模型");
            return Err(AppError::no_model_registered());
        }

        let best = select_model(normalized, &models, self.match_threshold).ok_or_else(|| {
            info!("🔍 没有找到与 '{}' 匹配的模型", handle);
            AppError::no_model_registered()
        })?;

        let entry = ModelCacheEntry::new(best.id.clone(), best.name.clone());
        self.cache.write().await.insert(handle.to_string(), entry.clone());

        info!("✅ 模型解析成功: '{}' -> {} ({})", handle, entry.model_id, entry.model_name);
        Ok(entry)
    }

    /// 读取未过期的缓存条目
    async fn cached(&self, handle: &str) -> Option<ModelCacheEntry> {
        let cache = self.cache.read().await;
        cache
            .get(handle)
            .filter(|entry| entry.is_fresh(self.cache_ttl, Utc::now()))
            .cloned()
    }

    /// 清理过期的缓存条目，返回清理数量
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh(self.cache_ttl, now));
        before - cache.len()
    }

    /// 启动后台任务，定期清理过期缓存条目
    pub fn spawn_purge(self: Arc<Self>, interval: std::time::Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.purge_expired().await;
                        if removed > 0 {
                            debug!("🧹 清理了 {} 个过期模型缓存", removed);
                        }
                    }
                }
            }
        })
    }

    /// 清空缓存
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// 拉取市场目录（供 /v1/models 使用）
    pub async fn catalog(&self) -> AppResult<Vec<ModelCatalogEntry>> {
        self.marketplace.fetch_models().await
    }

    #[cfg(test)]
    pub(crate) async fn insert_entry(&self, handle: &str, entry: ModelCacheEntry) {
        self.cache.write().await.insert(handle.to_string(), entry);
    }
}

/// 从目录中选出与模型名最匹配的条目
///
/// 子串候选中分数最高者胜出，同分时保留目录中靠前的条目；
/// 没有子串候选时，全量打分并要求分数严格大于阈值
pub fn select_model<'a>(
    handle: &str,
    models: &'a [ModelCatalogEntry],
    threshold: f64,
) -> Option<&'a ModelCatalogEntry> {
    let search = handle.to_lowercase();

    let mut best: Option<(&ModelCatalogEntry, f64)> = None;
    for model in models {
        let name = model.name.to_lowercase();
        if name.contains(&search) || search.contains(&name) {
            let score = similarity(&search, &name);
            debug!("🔍 子串匹配: '{}' 得分 {:.2}", model.name, score);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((model, score));
            }
        }
    }

    if let Some((model, score)) = best {
        debug!("🎯 选中最佳匹配: '{}' 得分 {:.2}", model.name, score);
        return Some(model);
    }

    let mut fuzzy: Option<(&ModelCatalogEntry, f64)> = None;
    for model in models {
        let score = similarity(handle, &model.name);
        if score > threshold && fuzzy.map_or(true, |(_, s)| score > s) {
            debug!("🔍 模糊匹配: '{}' 得分 {:.2}", model.name, score);
            fuzzy = Some((model, score));
        }
    }

    fuzzy.map(|(model, _)| model)
}
