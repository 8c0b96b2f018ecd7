//! 熔断器
//!
//! 保护聊天补全上游调用的进程级熔断器：
//! - Closed: 统计窗口内请求数达到下限且失败率超过阈值时开启
//! - Open: 冷却期内直接失败，不访问上游
//! - HalfOpen: 最多放行若干探测请求，全部成功则关闭，任一失败重新开启

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::shared::constants::circuit_breaker as defaults;
use crate::shared::{AppError, AppResult};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,   // 正常状态
    Open,     // 熔断开启
    HalfOpen, // 半开状态
}

/// 熔断器参数
#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    /// Closed 状态下的统计窗口
    pub window: Duration,
    /// 触发熔断所需的最少请求数
    pub min_requests: u32,
    /// 失败率阈值（严格大于时触发）
    pub failure_ratio: f64,
    /// Open 状态持续时间
    pub cooldown: Duration,
    /// HalfOpen 状态下的最大并发探测数，也是关闭所需的连续成功数
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(defaults::WINDOW_SECONDS),
            min_requests: defaults::MIN_REQUESTS,
            failure_ratio: defaults::FAILURE_RATIO,
            cooldown: Duration::from_secs(defaults::COOLDOWN_SECONDS),
            max_half_open_requests: defaults::MAX_HALF_OPEN_REQUESTS,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    /// 每次状态转换递增，许可只在签发时的代内生效
    generation: u64,
    window_start: Instant,
    requests: u32,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl BreakerInner {
    fn new(generation: u64) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            generation,
            window_start: Instant::now(),
            requests: 0,
            failures: 0,
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }

    fn clear_counts(&mut self, now: Instant) {
        self.window_start = now;
        self.requests = 0;
        self.failures = 0;
    }
}

/// 熔断器放行许可
///
/// 调用结束后通过 `record_success` / `record_failure` 上报结果；
/// 未上报就被丢弃（例如客户端断开导致请求future被取消）时按失败计，
/// 半开状态下占用的探测名额随之释放
#[must_use = "许可需要上报调用结果"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    admitted_as: CircuitBreakerState,
    settled: bool,
}

impl std::fmt::Debug for BreakerPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("generation", &self.generation)
            .field("admitted_as", &self.admitted_as)
            .field("settled", &self.settled)
            .finish()
    }
}

impl BreakerPermit<'_> {
    /// 签发许可时熔断器所处的状态
    pub fn admitted_as(&self) -> CircuitBreakerState {
        self.admitted_as
    }

    pub fn record_success(mut self) {
        self.settle(true);
    }

    pub fn record_failure(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, success: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.breaker.on_result(self.generation, success);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("⚠️ 熔断器许可未上报结果即被丢弃，按失败计");
            self.settle(false);
        }
    }
}

/// 熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(BreakerInner::new(0)),
            transitions: AtomicU64::new(0),
        }
    }

    /// 当前状态（会推进 Open -> HalfOpen 的超时转换）
    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.lock();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    /// 状态转换总次数
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// 检查是否允许请求通过，放行时返回许可，熔断时直接返回上游错误
    pub fn allow_request(&self) -> AppResult<BreakerPermit<'_>> {
        let mut inner = self.lock();
        let now = Instant::now();
        self.advance(&mut inner, now);

        match inner.state {
            CircuitBreakerState::Closed => {
                inner.requests += 1;
            }
            CircuitBreakerState::Open => {
                debug!("⛔ 熔断器开启，拒绝请求");
                return Err(AppError::Upstream("熔断器开启，上游暂不可用".to_string()));
            }
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_in_flight >= self.settings.max_half_open_requests {
                    debug!("⛔ 半开状态探测请求已满，拒绝请求");
                    return Err(AppError::Upstream("熔断器半开，探测请求过多".to_string()));
                }
                inner.half_open_in_flight += 1;
            }
        }

        Ok(BreakerPermit {
            breaker: self,
            generation: inner.generation,
            admitted_as: inner.state,
            settled: false,
        })
    }

    /// 重置熔断器
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        *inner = BreakerInner::new(generation);
        info!("🔄 熔断器已重置为正常状态");
    }

    fn on_result(&self, generation: u64, success: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            // 状态已经转换过，旧许可的结果不再计入
            debug!("⏭️ 忽略过期许可的调用结果");
            return;
        }

        let now = Instant::now();
        match (inner.state, success) {
            (CircuitBreakerState::Closed, true) => {}
            (CircuitBreakerState::Closed, false) => {
                inner.failures += 1;
                let ratio = inner.failures as f64 / inner.requests.max(1) as f64;
                if inner.requests >= self.settings.min_requests && ratio > self.settings.failure_ratio {
                    warn!(
                        "🔥 熔断器开启: 窗口内 {} 次请求失败 {} 次",
                        inner.requests, inner.failures
                    );
                    self.transition(&mut inner, CircuitBreakerState::Open, now);
                }
            }
            (CircuitBreakerState::HalfOpen, true) => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.max_half_open_requests {
                    self.transition(&mut inner, CircuitBreakerState::Closed, now);
                }
            }
            (CircuitBreakerState::HalfOpen, false) => {
                warn!("🔥 熔断器重新开启: 半开状态下探测失败");
                self.transition(&mut inner, CircuitBreakerState::Open, now);
            }
            // Open 状态不签发许可，同代内不会走到这里
            (CircuitBreakerState::Open, _) => {}
        }
    }

    fn advance(&self, inner: &mut BreakerInner, now: Instant) {
        match inner.state {
            CircuitBreakerState::Closed => {
                if now.duration_since(inner.window_start) >= self.settings.window {
                    inner.clear_counts(now);
                }
            }
            CircuitBreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.settings.cooldown);
                if cooled {
                    self.transition(inner, CircuitBreakerState::HalfOpen, now);
                }
            }
            CircuitBreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.clear_counts(now);
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        inner.opened_at = match to {
            CircuitBreakerState::Open => Some(now),
            _ => None,
        };

        self.transitions.fetch_add(1, Ordering::Relaxed);
        info!("⚡ 熔断器状态变化: {:?} -> {:?}", from, to);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // 持锁期间不会panic，中毒时直接取回内部状态
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            window: Duration::from_secs(10),
            min_requests: 5,
            failure_ratio: 0.5,
            cooldown: Duration::from_millis(50),
            max_half_open_requests: 3,
        }
    }

    fn fail_n(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            breaker.allow_request().unwrap().record_failure();
        }
    }

    fn open_then_cool(breaker: &CircuitBreaker) {
        fail_n(breaker, 5);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
    }

    #[test]
    fn test_stays_closed_below_min_requests() {
        let breaker = CircuitBreaker::new(fast_settings());
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_opens_when_ratio_exceeded() {
        let breaker = CircuitBreaker::new(fast_settings());
        fail_n(&breaker, 5);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert_eq!(breaker.transition_count(), 1);

        let err = breaker.allow_request().unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
    }

    #[test]
    fn test_ratio_at_threshold_stays_closed() {
        let breaker = CircuitBreaker::new(fast_settings());
        for i in 0..6 {
            let permit = breaker.allow_request().unwrap();
            if i % 2 == 1 {
                permit.record_failure();
            } else {
                permit.record_success();
            }
        }
        // 3/6 = 0.5，不超过阈值
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_and_closes() {
        let breaker = CircuitBreaker::new(fast_settings());
        open_then_cool(&breaker);

        let permits: Vec<_> = (0..3).map(|_| breaker.allow_request().unwrap()).collect();
        assert!(permits.iter().all(|p| p.admitted_as() == CircuitBreakerState::HalfOpen));
        // 探测数已满
        assert!(breaker.allow_request().is_err());

        for permit in permits {
            permit.record_success();
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.transition_count(), 3);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_settings());
        open_then_cool(&breaker);

        breaker.allow_request().unwrap().record_failure();
        assert!(breaker.allow_request().is_err());
    }

    #[test]
    fn test_dropped_probes_do_not_wedge_half_open() {
        let breaker = CircuitBreaker::new(fast_settings());
        open_then_cool(&breaker);

        // 三个探测都在上报前被取消
        let permits: Vec<_> = (0..3).map(|_| breaker.allow_request().unwrap()).collect();
        drop(permits);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        // 冷却后重新开放探测并能恢复
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        for _ in 0..3 {
            breaker.allow_request().unwrap().record_success();
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_dropped_permit_counts_as_failure_when_closed() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..5 {
            let _permit = breaker.allow_request().unwrap();
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_stale_closed_permit_is_ignored_in_half_open() {
        let breaker = CircuitBreaker::new(fast_settings());
        let straggler = breaker.allow_request().unwrap();
        assert_eq!(straggler.admitted_as(), CircuitBreakerState::Closed);

        // 加上未完成的请求共 5 次，4 次失败即开启
        fail_n(&breaker, 4);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

        let probes: Vec<_> = (0..3).map(|_| breaker.allow_request().unwrap()).collect();
        // Closed 时放行的请求完成，不算探测成功，也不释放探测名额
        straggler.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        assert!(breaker.allow_request().is_err());

        for probe in probes {
            probe.record_success();
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_window_resets_counts() {
        let settings = CircuitBreakerSettings {
            window: Duration::from_millis(30),
            ..fast_settings()
        };
        let breaker = CircuitBreaker::new(settings);
        fail_n(&breaker, 4);
        std::thread::sleep(Duration::from_millis(50));
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::new(fast_settings());
        let straggler = breaker.allow_request().unwrap();
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);

        // 重置前签发的许可不影响新状态
        straggler.record_failure();
        let permit = breaker.allow_request().unwrap();
        permit.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }
}
