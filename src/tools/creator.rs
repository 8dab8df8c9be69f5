//! agent_creator 工具：由模型输出的 `<agent>` 块创建并启动新 Agent
//!
//! ```text
//! <agent>
//!   <type>web_search</type>
//!   <name>recon</name>
//!   <description>Collect public info</description>
//!   <parameters><query>example.com</query></parameters>
//! </agent>
//! ```
//!
//! 发起调用的 Agent（若有）成为新 Agent 在关系图中的父节点。所有失败都以纯文本返回，不向上抛出。

use async_trait::async_trait;

use crate::core::error::OrchestratorError;
use crate::core::orchestrator::WeakOrchestrator;
use crate::core::state::AgentId;
use crate::tools::protocol::{self, Command, Detection};
use crate::tools::{Tool, ToolError};

tokio::task_local! {
    /// 当前正在执行工具的 Agent id（由对话循环设置）
    pub static CURRENT_AGENT: AgentId;
}

pub const AGENT_CREATOR: &str = "agent_creator";

/// 派生 Agent 的工具；只持有编排器的弱引用
pub struct AgentCreatorTool {
    orchestrator: WeakOrchestrator,
}

impl AgentCreatorTool {
    pub fn new(orchestrator: WeakOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// 解析文本中的 `<agent>` 块并启动；返回给模型（或调用方）看的结果文本
    pub fn create_from_text(&self, text: &str) -> String {
        match self.spawn(text) {
            Ok(msg) | Err(msg) => msg,
        }
    }

    fn spawn(&self, text: &str) -> Result<String, String> {
        let mut spec = protocol::parse_agent_block(text)
            .map_err(|e| format!("Failed to create agent: {e}"))?;
        if spec.parent.is_none() {
            spec.parent = CURRENT_AGENT.try_with(|id| *id).ok();
        }
        let orchestrator = self
            .orchestrator
            .upgrade()
            .ok_or_else(|| format!("Failed to create agent: {}", OrchestratorError::Closed))?;
        let name = spec.name.clone();
        let agent = orchestrator
            .spawn_agent(spec)
            .map_err(|e| format!("Failed to create agent '{name}': {e}"))?;
        tracing::info!(
            agent_id = %agent.id(),
            parent = ?agent.spec().parent,
            name = %agent.name(),
            "agent created from text block"
        );
        Ok(format!(
            "Agent '{}' created with id {} and started.",
            agent.name(),
            agent.id()
        ))
    }
}

#[async_trait]
impl Tool for AgentCreatorTool {
    fn name(&self) -> &str {
        AGENT_CREATOR
    }

    fn describe(&self) -> &str {
        "Create and start a new agent. Write an <agent> block with <name>, optional <type> and \
         <description>, and either <instructions>, <steps><step>...</step></steps> or <parameters>."
    }

    fn spawns_agents(&self) -> bool {
        true
    }

    /// 识别 `<agent>` 块而不是 `<tool>` 块
    fn detect(&self, text: &str) -> Detection {
        let Some((el, offset)) = protocol::find_agent_block(text) else {
            return Detection::NoMatch;
        };
        let raw = text.get(el.start..el.end).unwrap_or_default();
        Detection::Matched {
            command: Command::new(AGENT_CREATOR).with("block", raw),
            offset,
        }
    }

    fn usage_example(&self) -> String {
        "<agent>\n  <type>web_search</type>\n  <name>agent_name</name>\n  \
         <description>what it does</description>\n  <parameters>\n    <query>...</query>\n  \
         </parameters>\n</agent>"
            .to_string()
    }

    async fn execute(&self, command: &Command) -> Result<String, ToolError> {
        let block = command
            .get("block")
            .ok_or_else(|| ToolError::InvalidArgument("missing <agent> block".to_string()))?;
        self.spawn(block).map_err(ToolError::Execution)
    }
}
