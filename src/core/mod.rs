//! 核心编排层：Agent 状态机、错误与恢复、任务关系图、编排器

pub mod agent;
pub mod builder;
pub mod definition;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod task_graph;

pub use agent::{Agent, AgentOutcome, AgentRuntime, CompletionReason, StatusCallback};
pub use builder::{build_backend, OrchestratorBuilder};
pub use definition::{synthesize_instructions, AgentSpec, ResolvedSpec};
pub use error::{
    AdmissionError, AgentError, CreationError, ErrorKind, OrchestratorError, RecoveryAction,
};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RateLimitScope, WeakOrchestrator, STOPPED_BY_ORCHESTRATOR,
};
pub use recovery::RecoveryEngine;
pub use state::{AgentId, AgentSnapshot, AgentStatus, StatusChange, StatusCounts};
pub use task_graph::{Direction, GraphError, Links, TaskGraph};
