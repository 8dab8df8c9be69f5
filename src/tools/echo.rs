//! Echo 工具（测试与演示用）
//!
//! 回显 `query` 或 `text` 参数；可以换名注册（例如作为 web_search 的离线替身）。

use async_trait::async_trait;

use crate::tools::{Command, Tool, ToolError};

/// Echo 工具：回显文本
pub struct EchoTool {
    name: String,
    description: String,
    required: &'static [&'static str],
}

impl EchoTool {
    pub fn new() -> Self {
        Self {
            name: "echo".to_string(),
            description: "Echo text back (for testing). Parameters: text".to_string(),
            required: &[],
        }
    }

    /// 以其他名字注册，必须带 query 参数
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: format!("{name} stub that returns its query unchanged. Parameters: query"),
            name,
            required: &["query"],
        }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> &str {
        &self.description
    }

    fn required_params(&self) -> &[&str] {
        self.required
    }

    fn optional_params(&self) -> &[&str] {
        &["text", "query"]
    }

    async fn execute(&self, command: &Command) -> Result<String, ToolError> {
        command
            .get("query")
            .or_else(|| command.get("text"))
            .map(str::to_string)
            .ok_or_else(|| ToolError::InvalidArgument("expected 'query' or 'text'".to_string()))
    }
}
