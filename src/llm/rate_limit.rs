//! 后端限流：最小调用间隔 + 限流信号指数退避
//!
//! acquire 在距上次调用不足 min_interval 时延迟（不拒绝）；on_rate_limited 返回本次应等待的退避时长并翻倍（封顶）；
//! 任一次成功调用后 record_success 把退避重置为基准值。

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmError;

/// 限流参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub min_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(2000),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// 限流器：可按编排器共享，也可每个 Agent 一个
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    last_call: tokio::sync::Mutex<Option<Instant>>,
    backoff: Mutex<Duration>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            backoff: Mutex::new(config.base_backoff),
            config,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 等到允许发起下一次调用；持锁等待，保证共享时调用依次间隔
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LlmError> {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.config.min_interval;
            if Instant::now() < ready {
                tracing::debug!(
                    delay_ms = (ready - Instant::now()).as_millis() as u64,
                    "spacing backend call"
                );
                tokio::select! {
                    _ = tokio::time::sleep_until(ready) => {}
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                }
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }

    /// 记录一次限流信号，返回应等待的时长；下一次翻倍，直到上限
    pub fn on_rate_limited(&self) -> Duration {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        let delay = *backoff;
        *backoff = (delay * 2).min(self.config.max_backoff);
        delay
    }

    pub fn record_success(&self) {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        *backoff = self.config.base_backoff;
    }

    /// 下一次限流时将等待的时长
    pub fn current_backoff(&self) -> Duration {
        *self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_resets() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.on_rate_limited(), Duration::from_secs(5));
        assert_eq!(limiter.on_rate_limited(), Duration::from_secs(10));
        assert_eq!(limiter.current_backoff(), Duration::from_secs(20));
        limiter.record_success();
        assert_eq!(limiter.current_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let limiter = RateLimiter::default();
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.on_rate_limited(), Duration::from_secs(300));
        assert_eq!(limiter.current_backoff(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_delays_to_min_interval() {
        let limiter = RateLimiter::default();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_honours_cancellation() {
        let limiter = RateLimiter::default();
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();
        assert_eq!(limiter.acquire(&cancel).await, Err(LlmError::Cancelled));
    }
}
