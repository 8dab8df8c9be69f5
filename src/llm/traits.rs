//! 模型后端抽象
//!
//! 所有后端（HTTP 网关 / Mock / 脚本化测试桩）实现 ModelBackend：send（非流式）、send_stream（流式文本块）。
//! LlmError 自带分类：暂时性（重试）、限流（退避）、拒绝（不可修复）。

use std::pin::Pin;
use std::sync::OnceLock;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use regex::Regex;
use thiserror::Error;

use crate::memory::Message;

/// 流式文本块
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 一次对话请求
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: 2000,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

/// 后端调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited by backend")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("backend returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("backend returned an empty response")]
    EmptyResponse,

    #[error("malformed backend response: {0}")]
    InvalidResponse(String),

    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

fn rate_limit_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\b429\b|rate.?limit|too many requests|quota exceeded)").ok()
    })
    .as_ref()
}

impl LlmError {
    /// 网络类暂时性错误：原地指数退避重试，不消耗迭代
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::Connection(_) | LlmError::Stream(_) => true,
            LlmError::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// 上游明确拒绝：不可修复
    pub fn is_rejection(&self) -> bool {
        matches!(self, LlmError::Rejected(_))
    }

    /// 按状态码归类 HTTP 错误
    pub fn from_status(code: u16, body: String, retry_after_ms: Option<u64>) -> Self {
        match code {
            429 => LlmError::RateLimited { retry_after_ms },
            500..=599 => LlmError::Status { code, body },
            400..=499 => LlmError::Rejected(format!("status {code}: {body}")),
            _ => LlmError::Status { code, body },
        }
    }

    /// 从自由文本错误信息归类（网关把上游错误包成字符串时）
    pub fn classify_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if rate_limit_pattern().map_or(false, |re| re.is_match(&msg)) {
            LlmError::RateLimited {
                retry_after_ms: None,
            }
        } else {
            LlmError::Other(msg)
        }
    }
}

/// 模型后端 trait
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// 后端名称（日志用）
    fn name(&self) -> &str;

    /// 非流式完成
    async fn send(&self, request: &ChatRequest) -> Result<String, LlmError>;

    /// 流式完成；默认把 send 的结果包成单块流
    async fn send_stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let content = self.send(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }

    /// 健康检查；默认总是健康
    async fn health(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(LlmError::from_status(429, String::new(), None).is_rate_limit());
        assert!(LlmError::from_status(503, "busy".into(), None).is_transient());
        assert!(LlmError::from_status(400, "bad".into(), None).is_rejection());
    }

    #[test]
    fn test_message_classification() {
        assert!(LlmError::classify_message("Error 429: Too Many Requests").is_rate_limit());
        assert!(LlmError::classify_message("Rate limit exceeded").is_rate_limit());
        assert!(!LlmError::classify_message("model overloaded").is_rate_limit());
    }
}
