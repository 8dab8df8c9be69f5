//! HTTP 模型网关后端
//!
//! POST `{base_url}/api/chat`，请求体 `{model, messages, temperature, max_tokens, stream}`。
//! 非流式时从多种响应形态中提取文本；流式时读取 SSE `data:` 行，遇到 `[DONE]` 结束。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::{ChatRequest, LlmError, ModelBackend, TextStream};

/// 网关连接参数
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11436".to_string(),
            model: "groq-gemma2-9b-it".to_string(),
            request_timeout: Duration::from_secs(45),
        }
    }
}

/// 基于 reqwest 的网关客户端
#[derive(Debug, Clone)]
pub struct GatewayBackend {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayBackend {
    pub fn new(config: GatewayConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Other(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        let resp = self
            .client
            .post(self.endpoint("api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after_ms = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let text = resp.text().await.unwrap_or_default();
        Err(LlmError::from_status(status.as_u16(), preview(&text), retry_after_ms))
    }
}

fn map_reqwest(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(0)
    } else if e.is_connect() {
        LlmError::Connection(e.to_string())
    } else if e.is_decode() || e.is_body() {
        LlmError::Stream(e.to_string())
    } else {
        LlmError::Connection(e.to_string())
    }
}

fn preview(s: &str) -> String {
    s.chars().take(300).collect()
}

/// 从网关 JSON 响应中取出回复文本；兼容 OpenAI 风格与若干简化形态
pub fn extract_content(v: &Value) -> Option<String> {
    let candidates = [
        v.pointer("/choices/0/message/content"),
        v.get("message").filter(|m| m.is_string()),
        v.pointer("/message/content"),
        v.get("content"),
        v.get("response"),
        v.get("text"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|c| c.as_str().map(str::to_string))
}

/// 单行 SSE 的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Chunk(String),
    Done,
    Error(String),
    Skip,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return SseLine::Skip;
    };
    if let Some(err) = v.get("error") {
        let msg = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return SseLine::Error(msg);
    }
    match v.pointer("/choices/0/delta/content").and_then(|c| c.as_str()) {
        Some(text) if !text.is_empty() => SseLine::Chunk(text.to_string()),
        _ => SseLine::Skip,
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buf: String,
    eof: bool,
    finished: bool,
}

async fn next_sse_chunk(mut st: SseState) -> Option<(Result<String, LlmError>, SseState)> {
    if st.finished {
        return None;
    }
    loop {
        if let Some(pos) = st.buf.find('\n') {
            let line: String = st.buf.drain(..=pos).collect();
            match parse_sse_line(&line) {
                SseLine::Chunk(text) => return Some((Ok(text), st)),
                SseLine::Done => return None,
                SseLine::Error(msg) => {
                    st.finished = true;
                    return Some((Err(LlmError::Stream(msg)), st));
                }
                SseLine::Skip => continue,
            }
        }
        if st.eof {
            if st.buf.trim().is_empty() {
                return None;
            }
            st.buf.push('\n');
            continue;
        }
        match st.bytes.next().await {
            Some(Ok(chunk)) => st.buf.push_str(&String::from_utf8_lossy(&chunk)),
            Some(Err(e)) => {
                st.finished = true;
                return Some((Err(LlmError::Stream(e.to_string())), st));
            }
            None => st.eof = true,
        }
    }
}

#[async_trait]
impl ModelBackend for GatewayBackend {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let resp = self.post(request, false).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if let Some(err) = body.get("error").and_then(|e| e.as_str()) {
            return Err(LlmError::classify_message(err));
        }
        extract_content(&body).ok_or_else(|| LlmError::InvalidResponse(preview(&body.to_string())))
    }

    async fn send_stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let resp = self.post(request, true).await?;
        let bytes: ByteStream = Box::pin(resp.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        let state = SseState {
            bytes,
            buf: String::new(),
            eof: false,
            finished: false,
        };
        Ok(Box::pin(stream::unfold(state, next_sse_chunk)))
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(self.endpoint("health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, base_url = %self.config.base_url, "gateway health check failed");
                false
            }
        }
    }
}
