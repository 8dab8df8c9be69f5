//! 带重试的后端调用
//!
//! 每次尝试前经过 RateLimiter；尝试本身有超时。暂时性错误原地指数退避重试（不消耗迭代），
//! 限流信号按 RateLimiter 的退避等待；流式调用把分块按到达顺序拼成一条回复，中途出错则退回一次非流式调用。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatRequest, LlmError, ModelBackend, RateLimiter};

/// 重试参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 暂时性错误的额外重试次数
    pub transient_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 连续限流的最大等待次数，超过后把错误交给循环
    pub max_rate_limit_retries: u32,
    /// 单次尝试超时
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            max_rate_limit_retries: 5,
            request_timeout: Duration::from_secs(45),
        }
    }
}

impl RetryConfig {
    /// 第 n 次（从 1 开始）暂时性重试前的等待
    pub fn transient_delay(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 包装任意 ModelBackend：限流、超时、重试、流式拼接
#[derive(Clone)]
pub struct RetryingBackend {
    inner: Arc<dyn ModelBackend>,
    limiter: Arc<RateLimiter>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn ModelBackend>, limiter: Arc<RateLimiter>, config: RetryConfig) -> Self {
        Self {
            inner,
            limiter,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.inner
    }

    /// 发起一次逻辑调用；返回完整回复文本
    pub async fn call(
        &self,
        request: &ChatRequest,
        stream: bool,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let mut transient = 0u32;
        let mut limited = 0u32;
        loop {
            self.limiter.acquire(cancel).await?;
            match self.attempt(request, stream).await {
                Ok(text) => {
                    self.limiter.record_success();
                    return Ok(text);
                }
                Err(LlmError::RateLimited { retry_after_ms }) => {
                    limited += 1;
                    if limited > self.config.max_rate_limit_retries {
                        return Err(LlmError::RateLimited { retry_after_ms });
                    }
                    let mut delay = self.limiter.on_rate_limited();
                    if let Some(ms) = retry_after_ms {
                        delay = delay.max(Duration::from_millis(ms));
                    }
                    tracing::warn!(
                        backend = self.inner.name(),
                        attempt = limited,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                }
                Err(e) if e.is_transient() => {
                    transient += 1;
                    if transient > self.config.transient_retries {
                        return Err(e);
                    }
                    let delay = self.config.transient_delay(transient);
                    tracing::warn!(
                        backend = self.inner.name(),
                        attempt = transient,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend error, retrying"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, request: &ChatRequest, stream: bool) -> Result<String, LlmError> {
        let limit = self.config.request_timeout;
        let fut = async {
            if stream {
                self.collect_stream(request).await
            } else {
                self.inner.send(request).await
            }
        };
        let text = timeout(limit, fut)
            .await
            .map_err(|_| LlmError::Timeout(limit.as_millis() as u64))??;
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }

    async fn collect_stream(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut chunks = self.inner.send_stream(request).await?;
        let mut out = String::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) => out.push_str(&text),
                Err(e) => {
                    tracing::warn!(
                        backend = self.inner.name(),
                        error = %e,
                        received = out.len(),
                        "stream failed midway, retrying without streaming"
                    );
                    return self.inner.send(request).await;
                }
            }
        }
        Ok(out)
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), LlmError> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::llm::{RateLimitConfig, ScriptedBackend};
    use crate::memory::Message;

    fn wrap(backend: Arc<ScriptedBackend>) -> RetryingBackend {
        RetryingBackend::new(
            backend,
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            RetryConfig::default(),
        )
    }

    fn req() -> ChatRequest {
        ChatRequest::new(vec![Message::user("hi")])
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_then_reset() {
        let limited = || Err(LlmError::RateLimited { retry_after_ms: None });
        let backend = Arc::new(ScriptedBackend::new(vec![limited(), limited(), Ok("ok".into())]));
        let rb = wrap(backend.clone());
        let cancel = CancellationToken::new();
        let start = Instant::now();
        assert_eq!(rb.call(&req(), false, &cancel).await.unwrap(), "ok");
        // 5s + 10s，其间的最小间隔已被退避覆盖
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert_eq!(backend.calls(), 3);
        assert_eq!(rb.limiter().current_backoff(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_in_place() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(LlmError::Connection("reset".into())),
            Err(LlmError::Timeout(10)),
            Ok("fine".into()),
        ]));
        let rb = wrap(backend.clone());
        let out = rb.call(&req(), false, &CancellationToken::new()).await;
        assert_eq!(out.unwrap(), "fine");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_exhausted() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Err(LlmError::Connection("down".into()))]).repeat_last(),
        );
        let rb = wrap(backend.clone());
        let out = rb.call(&req(), false, &CancellationToken::new()).await;
        assert!(matches!(out, Err(LlmError::Connection(_))));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(LlmError::Rejected("bad".into()))]));
        let rb = wrap(backend.clone());
        let out = rb.call(&req(), false, &CancellationToken::new()).await;
        assert!(matches!(out, Err(LlmError::Rejected(_))));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_chunks_concatenate_in_order() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![])
                .with_stream(vec![Ok("task ".into()), Ok("comp".into()), Ok("leted".into())]),
        );
        let rb = wrap(backend.clone());
        let out = rb.call(&req(), true, &CancellationToken::new()).await;
        assert_eq!(out.unwrap(), "task completed");
        assert_eq!(backend.stream_calls(), 1);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_midstream_error_falls_back_to_send() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok("whole reply".into())])
                .with_stream(vec![Ok("partial".into()), Err(LlmError::Stream("eof".into()))]),
        );
        let rb = wrap(backend.clone());
        let out = rb.call(&req(), true, &CancellationToken::new()).await;
        assert_eq!(out.unwrap(), "whole reply");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reply_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("   ".into())]));
        let rb = wrap(backend);
        let out = rb.call(&req(), false, &CancellationToken::new()).await;
        assert_eq!(out, Err(LlmError::EmptyResponse));
    }

    #[test]
    fn test_transient_delay_is_capped() {
        let c = RetryConfig::default();
        assert_eq!(c.transient_delay(1), Duration::from_secs(1));
        assert_eq!(c.transient_delay(2), Duration::from_secs(2));
        assert_eq!(c.transient_delay(10), Duration::from_secs(8));
    }
}
