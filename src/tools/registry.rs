//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / describe / detect / execute），由 ToolRegistry 按注册顺序保存；
//! 每个 Agent 通过 ToolSet 看到注册表的一个子集。注册表级禁用的工具对检测不可见。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::tools::protocol::{self, normalize_name, Command, Detection};

/// 工具执行错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Execution(String),

    #[error("timed out after {0} s")]
    Timeout(u64),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("unknown tool: {0}")]
    Unknown(String),
}

/// 工具 trait：名称、描述（供模型理解）、必填/可选参数、检测、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（协议块中的 name）
    fn name(&self) -> &str;

    /// 工具描述（写入 system prompt）
    fn describe(&self) -> &str;

    fn required_params(&self) -> &[&str] {
        &[]
    }

    fn optional_params(&self) -> &[&str] {
        &[]
    }

    fn enabled(&self) -> bool {
        true
    }

    /// 能否派生新 Agent；默认不进入 worker 的工具集
    fn spawns_agents(&self) -> bool {
        false
    }

    /// 在一段回复中检测对本工具的调用；默认按 `<tool>` 语法
    fn detect(&self, text: &str) -> Detection {
        protocol::detect_for(text, self.name(), self.required_params())
    }

    /// 写进 prompt 的调用示例
    fn usage_example(&self) -> String {
        let params: String = self
            .required_params()
            .iter()
            .map(|p| format!("\n  <{p}>...</{p}>"))
            .collect();
        format!("<tool name=\"{}\">{}\n</tool>", self.name(), params)
    }

    async fn execute(&self, command: &Command) -> Result<String, ToolError>;
}

/// 工具注册表：保持注册顺序，检测时按此顺序打破平局
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    disabled: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具替换原位置
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let key = normalize_name(tool.name());
        match self.tools.iter().position(|t| normalize_name(t.name()) == key) {
            Some(i) => self.tools[i] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let key = normalize_name(name);
        self.tools
            .iter()
            .find(|t| normalize_name(t.name()) == key)
            .cloned()
    }

    /// 运行时开关；禁用后检测不可见
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        let mut disabled = self.disabled.write().unwrap_or_else(|e| e.into_inner());
        if enabled {
            disabled.remove(&normalize_name(name));
        } else {
            disabled.insert(normalize_name(name));
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        let key = normalize_name(name);
        let disabled = self.disabled.read().unwrap_or_else(|e| e.into_inner());
        !disabled.contains(&key) && self.get(name).map(|t| t.enabled()).unwrap_or(false)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// 当前启用的工具，按注册顺序
    pub fn active(&self) -> Vec<Arc<dyn Tool>> {
        self.tools
            .iter()
            .filter(|t| self.is_enabled(t.name()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// 单个 Agent 可见的工具集合
#[derive(Clone)]
pub struct ToolSet {
    registry: Arc<ToolRegistry>,
    allow: Option<Vec<String>>,
}

impl ToolSet {
    /// 全部普通工具（不含派生 Agent 的工具）
    pub fn all(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            allow: None,
        }
    }

    /// 只允许列出的工具（可包含派生 Agent 的工具）
    pub fn only<I, S>(registry: Arc<ToolRegistry>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            registry,
            allow: Some(names.into_iter().map(|n| normalize_name(n.as_ref())).collect()),
        }
    }

    pub fn empty(registry: Arc<ToolRegistry>) -> Self {
        Self::only(registry, Vec::<String>::new())
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 当前可用工具，按注册顺序
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.registry
            .active()
            .into_iter()
            .filter(|t| match &self.allow {
                Some(allow) => allow.contains(&normalize_name(t.name())),
                None => !t.spawns_agents(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools().is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let key = normalize_name(name);
        self.tools()
            .into_iter()
            .find(|t| normalize_name(t.name()) == key)
    }

    /// 在回复中检测工具调用：取文本位置最早的完整块（同位置按注册顺序），否则最早的缺参块
    pub fn detect(&self, text: &str) -> Detection {
        let mut best_match: Option<Detection> = None;
        let mut best_invalid: Option<Detection> = None;
        for tool in self.tools() {
            let d = tool.detect(text);
            let slot = match &d {
                Detection::Matched { .. } => &mut best_match,
                Detection::Invalid { .. } => &mut best_invalid,
                Detection::NoMatch => continue,
            };
            let earlier = match (slot.as_ref().and_then(Detection::offset), d.offset()) {
                (Some(cur), Some(new)) => new < cur,
                _ => true,
            };
            if earlier {
                *slot = Some(d);
            }
        }
        best_match.or(best_invalid).unwrap_or(Detection::NoMatch)
    }
}
