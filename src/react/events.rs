//! 循环过程事件：状态迁移、迭代、回复、工具调用、观察、恢复与结束，供订阅者实时展示

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::state::{AgentId, AgentStatus};
use crate::react::completion::CompletionReason;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    IterationStarted {
        agent_id: AgentId,
        iteration: usize,
        max_iterations: usize,
    },
    /// 模型回复（预览）
    Reply {
        agent_id: AgentId,
        iteration: usize,
        preview: String,
    },
    ToolCall {
        agent_id: AgentId,
        iteration: usize,
        tool: String,
        parameters: BTreeMap<String, String>,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        agent_id: AgentId,
        iteration: usize,
        tool: String,
        success: bool,
        preview: String,
    },
    Recovery {
        agent_id: AgentId,
        iteration: usize,
        action: String,
        detail: String,
    },
    Completed {
        agent_id: AgentId,
        iterations: usize,
        reason: CompletionReason,
    },
    Failed {
        agent_id: AgentId,
        error: String,
    },
}

impl AgentEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            AgentEvent::StatusChanged { agent_id, .. }
            | AgentEvent::IterationStarted { agent_id, .. }
            | AgentEvent::Reply { agent_id, .. }
            | AgentEvent::ToolCall { agent_id, .. }
            | AgentEvent::Observation { agent_id, .. }
            | AgentEvent::Recovery { agent_id, .. }
            | AgentEvent::Completed { agent_id, .. }
            | AgentEvent::Failed { agent_id, .. } => *agent_id,
        }
    }
}

pub fn preview(text: &str) -> String {
    const MAX: usize = 200;
    if text.chars().count() > MAX {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    } else {
        text.to_string()
    }
}
