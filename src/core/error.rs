//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 的可修复性决定注入诊断消息（Diagnose）还是终止（Abort）。
//! 准入拒绝（AdmissionError）是面向调用方的独立错误，不会被引擎排队或自动重试。

use thiserror::Error;

use crate::core::state::{AgentId, AgentStatus};
use crate::llm::LlmError;

/// 错误的可恢复性分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 暂时性：以 User 诊断消息反馈给模型，连续 3 次才终止
    Fixable,
    /// 任务在当前输入下不可能完成：直接进入 Failed
    Unfixable,
}

/// Agent 运行过程中可能出现的错误（后端、工具、协议、生命周期）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool '{tool}' failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("{diagnostic}")]
    InvalidToolRequest { tool: String, diagnostic: String },

    #[error("API server is not available")]
    BackendUnavailable,

    #[error("Agent {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Llm(e) if e.is_rejection() => ErrorKind::Unfixable,
            AgentError::Llm(_) => ErrorKind::Fixable,
            AgentError::ToolExecutionFailed { .. } => ErrorKind::Fixable,
            AgentError::InvalidToolRequest { .. } => ErrorKind::Fixable,
            AgentError::BackendUnavailable => ErrorKind::Unfixable,
            AgentError::InvalidTransition { .. } => ErrorKind::Unfixable,
            AgentError::Cancelled => ErrorKind::Unfixable,
        }
    }

    pub fn is_fixable(&self) -> bool {
        self.kind() == ErrorKind::Fixable
    }
}

/// 并发上限触发的准入拒绝
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Maximum concurrent agents ({limit}) reached ({working} working). Please wait for some agents to complete.")]
    CapacityReached { limit: usize, working: usize },
}

/// Agent 描述不合法（缺名称、缺指令、创建块无法解析）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreationError {
    #[error("agent name is required")]
    MissingName,

    #[error("agent '{0}' has no instructions and no parameters to synthesize them from")]
    MissingInstructions(String),

    #[error("no <agent> block found")]
    NoAgentBlock,

    #[error("unknown parent agent {0}")]
    UnknownParent(AgentId),
}

/// 编排器 create_agent 的错误：准入或创建
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Creation(#[from] CreationError),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("agent {id} cannot be started from {status}")]
    NotStartable { id: AgentId, status: AgentStatus },

    /// 编排器已关闭（弱引用失效）
    #[error("orchestrator is no longer running")]
    Closed,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将诊断作为 User 消息注入下一轮，消耗一次迭代
    Diagnose(String),
    /// 终止当前任务，记录原因
    Abort(String),
}
