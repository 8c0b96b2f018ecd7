//! 工具函数模块

use std::time::Duration;

/// 生成请求ID
pub fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// 计算第 `attempt` 次重试前的退避时间（attempt 从1开始）
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// 格式化持续时间
pub fn format_duration_ms(milliseconds: u64) -> String {
    if milliseconds < 1000 {
        format!("{}ms", milliseconds)
    } else if milliseconds < 60_000 {
        let seconds = milliseconds as f64 / 1000.0;
        format!("{:.1}s", seconds)
    } else {
        let minutes = milliseconds / 60_000;
        let seconds = (milliseconds % 60_000) / 1000;
        format!("{}m{}s", minutes, seconds)
    }
}

/// 截断过长的日志内容
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
