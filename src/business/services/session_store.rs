//! 会话存储
//!
//! 按模型ID缓存市场会话。会话在过期时间内每次使用都会滑动续期，
//! 过期后重新向市场申请；后台任务定期清理过期会话。

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::business::domain::Session;
use crate::infrastructure::config::SessionConfig;
use crate::infrastructure::MarketplaceApi;
use crate::shared::utils::{backoff_delay, format_duration_ms};
use crate::shared::{AppError, AppResult};

/// 会话存储
pub struct SessionStore {
    marketplace: Arc<dyn MarketplaceApi>,
    sessions: RwLock<HashMap<String, Session>>,
    /// 每个模型ID一把创建锁，开启单飞时使用
    creation_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    expiration: ChronoDuration,
    session_duration_seconds: u64,
    max_create_attempts: u32,
    retry_base_delay: Duration,
    single_flight: bool,
}

impl SessionStore {
    pub fn new(marketplace: Arc<dyn MarketplaceApi>, config: &SessionConfig) -> Self {
        Self {
            marketplace,
            sessions: RwLock::new(HashMap::new()),
            creation_locks: StdMutex::new(HashMap::new()),
            expiration: ChronoDuration::seconds(config.expiration_seconds as i64),
            session_duration_seconds: config.session_duration_seconds,
            max_create_attempts: config.max_create_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
            single_flight: config.single_flight,
        }
    }

    /// 确保模型ID有一个有效会话
    ///
    /// 已有有效会话时滑动续期并返回，否则向市场申请新会话
    #[instrument(skip(self))]
    pub async fn ensure(&self, model_id: &str, model_name: &str) -> AppResult<Session> {
        if let Some(session) = self.take_valid(model_id).await {
            debug!("♻️ 复用会话 {} (模型 {})", session.session_id, model_id);
            return Ok(session);
        }

        if !self.single_flight {
            return self.create(model_id, model_name).await;
        }

        let lock = self.creation_lock(model_id);
        let _guard = lock.lock().await;

        // 等锁期间可能已由其他请求创建
        if let Some(session) = self.take_valid(model_id).await {
            debug!("♻️ 复用并发创建的会话 {} (模型 {})", session.session_id, model_id);
            return Ok(session);
        }

        self.create(model_id, model_name).await
    }

    /// 获取模型ID对应的有效会话（不续期）
    pub async fn get(&self, model_id: &str) -> Option<Session> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        sessions
            .get(model_id)
            .filter(|s| s.is_valid(self.expiration, now))
            .cloned()
    }

    /// 按会话ID查找有效会话
    pub async fn find_by_session_id(&self, session_id: &str) -> Option<Session> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.session_id == session_id && s.is_valid(self.expiration, now))
            .cloned()
    }

    /// 滑动续期，返回续期后的会话
    pub async fn touch(&self, model_id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(model_id)?;
        if !session.is_valid(self.expiration, now) {
            return None;
        }
        session.created_at = now;
        Some(session.clone())
    }

    /// 清理过期会话，返回清理数量
    pub async fn sweep_expired(&self) -> usize {
        let removed = {
            let mut sessions = self.sessions.write().await;
            purge_expired(&mut sessions, self.expiration)
        };

        // 清理无人持有的创建锁
        if let Ok(mut locks) = self.creation_locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        if removed > 0 {
            info!("🧹 清理了 {} 个过期会话", removed);
        }
        removed
    }

    /// 启动后台清理任务，取消令牌触发后退出
    pub fn spawn_sweep(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("🧹 会话清理任务已启动，间隔 {}", format_duration_ms(interval.as_millis() as u64));
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即触发，跳过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("🛑 会话清理任务已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_expired().await;
                    }
                }
            }
        })
    }

    /// 清空所有会话
    pub async fn clear(&self) {
        self.sessions.write().await.clear();
        if let Ok(mut locks) = self.creation_locks.lock() {
            locks.clear();
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 直接写入会话
    pub async fn insert(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.model_id.clone(), session);
    }

    /// 持锁清理过期会话，并对有效会话滑动续期
    async fn take_valid(&self, model_id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        purge_expired(&mut sessions, self.expiration);

        let session = sessions.get_mut(model_id)?;
        session.created_at = now;
        Some(session.clone())
    }

    fn creation_lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .creation_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 带指数退避的会话创建，成功后先删除旧会话再写入
    async fn create(&self, model_id: &str, model_name: &str) -> AppResult<Session> {
        let mut last_error: Option<AppError> = None;

        for attempt in 1..=self.max_create_attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.retry_base_delay, attempt - 1);
                debug!("⏳ 第 {} 次重试前等待 {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }

            match self
                .marketplace
                .create_session(model_id, self.session_duration_seconds)
                .await
            {
                Ok(session_id) => {
                    let session = Session::new(session_id, model_id, model_name);
                    {
                        let mut sessions = self.sessions.write().await;
                        sessions.remove(model_id);
                        sessions.insert(model_id.to_string(), session.clone());
                    }
                    info!("🔑 为模型 {} 创建会话 {}", model_id, session.session_id);
                    return Ok(session);
                }
                Err(e) => {
                    let message = e.to_string();
                    if message.to_lowercase().contains("nonce") {
                        warn!("⚠️ 创建会话遇到 nonce 错误 (第 {}/{} 次): {}", attempt, self.max_create_attempts, message);
                    } else {
                        warn!("⚠️ 创建会话失败 (第 {}/{} 次): {}", attempt, self.max_create_attempts, message);
                    }
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "未知错误".to_string());
        error!("❌ 模型 {} 的会话创建在 {} 次尝试后失败", model_id, self.max_create_attempts);
        Err(AppError::Session(format!(
            "会话创建在 {} 次尝试后失败: {}",
            self.max_create_attempts, cause
        )))
    }
}

fn purge_expired(sessions: &mut HashMap<String, Session>, expiration: ChronoDuration) -> usize {
    let now = Utc::now();
    let before = sessions.len();
    sessions.retain(|_, s| s.is_valid(expiration, now));
    before - sessions.len()
}
