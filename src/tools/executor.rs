//! 工具执行器
//!
//! 对每次调用施加超时并捕获 panic，输出按上限截断（附截断标记）；
//! 任何失败都转成可写入对话的诊断文本，不会向上抛出。每次调用输出结构化审计日志（JSON）。

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::tools::{Command, ToolError, ToolSet};

/// 工具使用日志的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolUsage {
    pub iteration: usize,
    pub tool: String,
    pub parameters: BTreeMap<String, String>,
    pub success: bool,
    pub output_chars: usize,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// 一次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success { tool: String, output: String },
    Failure { tool: String, error: ToolError },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    /// 写回对话的 User 消息
    pub fn message(&self) -> String {
        match self {
            ToolOutcome::Success { tool, output } => {
                format!("Tool '{tool}' executed successfully.\n\nResults:\n{output}")
            }
            ToolOutcome::Failure { tool, error } => format!(
                "Tool '{tool}' encountered an error: {error}\nPlease continue with available information."
            ),
        }
    }
}

/// 工具执行器：超时、panic 捕获、截断、审计
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
    max_output_chars: usize,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(30, 8000)
    }
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64, max_output_chars: usize) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_output_chars,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 在 tools 中查找并执行命令
    pub async fn execute(
        &self,
        tools: &ToolSet,
        command: &Command,
        iteration: usize,
    ) -> (ToolOutcome, ToolUsage) {
        let start = Instant::now();
        let at = Utc::now();
        let name = command.tool_name.clone();

        let result = match tools.get(&name) {
            None => Err(ToolError::Unknown(name.clone())),
            Some(tool) => {
                let fut = AssertUnwindSafe(tool.execute(command)).catch_unwind();
                match timeout(self.timeout, fut).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(panic)) => Err(ToolError::Panicked(panic_message(panic.as_ref()))),
                    Err(_) => Err(ToolError::Timeout(self.timeout.as_secs())),
                }
            }
        };

        let outcome_label = match &result {
            Ok(_) => "ok",
            Err(ToolError::Timeout(_)) => "timeout",
            Err(ToolError::Panicked(_)) => "panic",
            Err(_) => "error",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.is_ok(),
            "outcome": outcome_label,
            "duration_ms": duration_ms,
            "iteration": iteration,
            "args_preview": args_preview(&command.parameters),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let outcome = match result {
            Ok(raw) => ToolOutcome::Success {
                tool: name.clone(),
                output: truncate_output(&raw, self.max_output_chars),
            },
            Err(error) => ToolOutcome::Failure {
                tool: name.clone(),
                error,
            },
        };
        let output_chars = match &outcome {
            ToolOutcome::Success { output, .. } => output.chars().count(),
            ToolOutcome::Failure { .. } => 0,
        };
        let usage = ToolUsage {
            iteration,
            tool: name,
            parameters: command.parameters.clone(),
            success: outcome.is_success(),
            output_chars,
            duration_ms,
            at,
        };
        (outcome, usage)
    }
}

/// 超出上限的部分截掉并附上标记
pub fn truncate_output(raw: &str, max_chars: usize) -> String {
    let total = raw.chars().count();
    if total <= max_chars {
        return raw.to_string();
    }
    let kept: String = raw.chars().take(max_chars).collect();
    format!(
        "{kept}\n\n[... output truncated: {} more characters]",
        total - max_chars
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &BTreeMap<String, String>) -> String {
    let s = serde_json::to_string(args).unwrap_or_default();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::tools::{EchoTool, Tool, ToolRegistry};

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }

        fn describe(&self) -> &str {
            "always panics"
        }

        async fn execute(&self, _command: &Command) -> Result<String, ToolError> {
            panic!("boom")
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn describe(&self) -> &str {
            "never finishes in time"
        }

        async fn execute(&self, _command: &Command) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    fn tools() -> ToolSet {
        let mut r = ToolRegistry::new();
        r.register(EchoTool::new());
        r.register(PanickyTool);
        r.register(SlowTool);
        ToolSet::all(Arc::new(r))
    }

    #[test]
    fn test_truncation_marker() {
        let out = truncate_output("abcdefghij", 4);
        assert_eq!(out, "abcd\n\n[... output truncated: 6 more characters]");
        assert_eq!(truncate_output("abc", 4), "abc");
    }

    #[tokio::test]
    async fn test_success_message_and_usage() {
        let exec = ToolExecutor::new(5, 3);
        let (outcome, usage) = exec
            .execute(&tools(), &Command::new("echo").with("text", "hello"), 2)
            .await;
        assert!(outcome.message().starts_with("Tool 'echo' executed successfully."));
        assert!(outcome.message().contains("[... output truncated: 2 more characters]"));
        assert!(usage.success);
        assert_eq!(usage.iteration, 2);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let (outcome, usage) = ToolExecutor::default()
            .execute(&tools(), &Command::new("panicky"), 1)
            .await;
        assert_eq!(
            outcome,
            ToolOutcome::Failure {
                tool: "panicky".into(),
                error: ToolError::Panicked("boom".into())
            }
        );
        assert!(!usage.success);
        assert!(outcome.message().contains("Please continue with available information."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_tool_error() {
        let exec = ToolExecutor::new(30, 100);
        let (outcome, _) = exec.execute(&tools(), &Command::new("slow"), 1).await;
        assert!(matches!(
            outcome,
            ToolOutcome::Failure {
                error: ToolError::Timeout(30),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_argument_is_reported() {
        let (outcome, _) = ToolExecutor::default()
            .execute(&tools(), &Command::new("echo"), 1)
            .await;
        assert!(outcome.message().contains("expected 'query' or 'text'"));
    }
}
