//! Conductor - Rust 多智能体任务编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Agent 状态机、错误与恢复、任务关系图、编排器
//! - **llm**: 模型后端抽象与实现（HTTP 网关 / Mock / 脚本化测试桩）、限流与重试
//! - **memory**: 单 Agent 对话存储与结果记录持久化
//! - **observability**: tracing 初始化
//! - **react**: 对话主循环、完成判定、prompt 构造、过程事件
//! - **tools**: 文本内嵌工具协议、注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{
    Agent, AgentId, AgentSpec, AgentStatus, Orchestrator, OrchestratorBuilder, OrchestratorError,
};
