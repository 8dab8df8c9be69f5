//! Mock 后端（用于测试与演示，无需 API）
//!
//! - MockBackend：首轮回显为 echo 工具调用，之后给出完成结论，便于本地跑通整个循环。
//! - ScriptedBackend：按脚本依次返回回复或错误，记录每次请求，可模拟流式分块与中途断流。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChatRequest, LlmError, ModelBackend, TextStream};
use crate::memory::Role;

/// Mock 后端：首轮回显最后一条 User 消息为 echo 工具调用，之后宣告完成
#[derive(Debug, Default)]
pub struct MockBackend;

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let answered = request
            .messages
            .iter()
            .any(|m| m.role == Role::Assistant);
        if answered {
            return Ok("Findings summary: the echo tool returned the task text.\n\nTask completed.".to_string());
        }
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!(
            "<tool name=\"echo\">\n  <text>{}</text>\n</tool>",
            escape(last_user)
        ))
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// 脚本化后端：确定性测试桩
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    streams: Mutex<VecDeque<Vec<Result<String, LlmError>>>>,
    repeat_last: bool,
    last: Mutex<Option<Result<String, LlmError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    stream_calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// 每次都返回同一段文本
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())]).repeat_last()
    }

    /// 脚本耗尽后重复最后一项
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// 每次调用前等待（配合取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 追加一次流式调用的分块序列；流脚本耗尽后退回到单块流
    pub fn with_stream(self, chunks: Vec<Result<String, LlmError>>) -> Self {
        lock(&self.streams).push_back(chunks);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    fn next_reply(&self) -> Result<String, LlmError> {
        let next = lock(&self.script).pop_front();
        match next {
            Some(item) => {
                *lock(&self.last) = Some(item.clone());
                item
            }
            None if self.repeat_last => lock(&self.last)
                .clone()
                .unwrap_or(Err(LlmError::EmptyResponse)),
            None => Err(LlmError::Other("script exhausted".to_string())),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.next_reply()
    }

    async fn send_stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let chunks = lock(&self.streams).pop_front();
        match chunks {
            Some(chunks) => {
                self.stream_calls.fetch_add(1, Ordering::SeqCst);
                lock(&self.requests).push(request.clone());
                Ok(Box::pin(stream::iter(chunks)))
            }
            None => {
                let content = self.send(request).await?;
                Ok(Box::pin(stream::iter(vec![Ok(content)])))
            }
        }
    }
}
