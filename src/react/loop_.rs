//! 对话主循环
//!
//! 每轮：检查取消 -> 调用后端（限流、重试在 RetryingBackend 内）-> 追加 Assistant 回复 -> 检测工具调用。
//! - 命中工具：执行至多一个，输出作为 User 消息追加，直接进入下一轮；
//! - 缺参块：诊断作为 User 消息追加，计一次失败；
//! - 无工具：询问完成判定器，前几轮未用工具时追加使用提示。
//! 连续 3 次失败或不可修复错误进入 Failed；到达硬上限一律结束。

use crate::core::agent::{Agent, AgentOutcome};
use crate::core::error::AgentError;
use crate::core::recovery::RecoveryEngine;
use crate::core::state::AgentStatus;
use crate::core::RecoveryAction;
use crate::llm::{ChatRequest, LlmError};
use crate::memory::Message;
use crate::react::completion::{CompletionContext, CompletionReason};
use crate::react::events::{preview, AgentEvent};
use crate::react::planner;
use crate::tools::creator::CURRENT_AGENT;
use crate::tools::{Detection, ToolOutcome};

/// 循环参数
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    /// 硬迭代上限
    pub max_iterations: usize,
    /// 前几轮没有工具调用时追加使用提示
    pub nudge_iterations: usize,
    pub max_consecutive_failures: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    /// 开始前探测后端健康
    pub health_check: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            nudge_iterations: 3,
            max_consecutive_failures: 3,
            temperature: 0.7,
            max_tokens: 2000,
            stream: false,
            health_check: true,
        }
    }
}

/// 进度：按迭代推进，结束前封顶 95
fn progress_for(iteration: usize, max: usize) -> u8 {
    let max = max.max(1);
    (10 + iteration.min(max) * 85 / max).min(95) as u8
}

/// 运行一个已处于 Working 的 Agent，直到终态；返回最终状态
pub async fn run(agent: Agent) -> AgentStatus {
    drive(&agent).await;
    persist(&agent).await;
    agent.status()
}

async fn drive(agent: &Agent) {
    let rt = agent.runtime();
    let settings = &rt.settings;
    let cancel = agent.cancel_token();
    let recovery = RecoveryEngine::new(settings.max_consecutive_failures);
    let id = agent.id();

    if settings.health_check && !rt.backend.backend().health().await {
        let err = AgentError::BackendUnavailable;
        tracing::error!(agent_id = %id, "backend health check failed");
        fail(agent, err.to_string());
        return;
    }

    let mut failures = 0usize;
    let mut tool_calls = 0usize;
    let mut last_tool_iteration: Option<usize> = None;
    let mut last_reply: Option<String> = None;
    let mut last_iteration = 0usize;

    for iteration in 1..=settings.max_iterations {
        if cancel.is_cancelled() || !agent.is_working() {
            tracing::debug!(agent_id = %id, iteration, "loop stopped before backend call");
            return;
        }
        last_iteration = iteration;
        agent.record_iteration(iteration, progress_for(iteration - 1, settings.max_iterations));
        agent.emit(AgentEvent::IterationStarted {
            agent_id: id,
            iteration,
            max_iterations: settings.max_iterations,
        });

        let request = ChatRequest::new(agent.conversation())
            .with_sampling(settings.temperature, settings.max_tokens);
        let reply = rt.backend.call(&request, settings.stream, &cancel).await;
        if cancel.is_cancelled() || !agent.is_working() {
            return;
        }

        let text = match reply {
            Ok(text) => text,
            Err(LlmError::Cancelled) => return,
            Err(e) => {
                failures += 1;
                tracing::warn!(agent_id = %id, iteration, failures, error = %e, "backend call failed");
                if !recover(agent, &recovery, AgentError::Llm(e), failures, iteration) {
                    return;
                }
                continue;
            }
        };

        if !agent.append(Message::assistant(text.clone())) {
            return;
        }
        agent.emit(AgentEvent::Reply {
            agent_id: id,
            iteration,
            preview: preview(&text),
        });
        last_reply = Some(text.clone());

        match rt.tools.detect(&text) {
            Detection::Matched { command, .. } => {
                tracing::info!(agent_id = %id, iteration, tool = %command.tool_name, "tool call detected");
                agent.emit(AgentEvent::ToolCall {
                    agent_id: id,
                    iteration,
                    tool: command.tool_name.clone(),
                    parameters: command.parameters.clone(),
                });
                let (outcome, usage) = CURRENT_AGENT
                    .scope(id, rt.executor.execute(&rt.tools, &command, iteration))
                    .await;
                agent.push_tool_usage(usage);
                tool_calls += 1;
                last_tool_iteration = Some(iteration);
                if !agent.append(Message::user(outcome.message())) {
                    return;
                }
                agent.emit(AgentEvent::Observation {
                    agent_id: id,
                    iteration,
                    tool: command.tool_name.clone(),
                    success: outcome.is_success(),
                    preview: preview(&outcome.message()),
                });
                if let ToolOutcome::Failure { tool, error } = &outcome {
                    failures += 1;
                    let err = AgentError::ToolExecutionFailed {
                        tool: tool.clone(),
                        reason: error.to_string(),
                    };
                    // 诊断已随工具输出写入对话，这里只判断是否终止
                    if let RecoveryAction::Abort(reason) = recovery.handle(&err, failures) {
                        fail(agent, reason);
                        return;
                    }
                } else {
                    failures = 0;
                }
            }
            Detection::Invalid { tool, diagnostic, .. } => {
                failures += 1;
                tracing::warn!(agent_id = %id, iteration, tool = %tool, "invalid tool request");
                let err = AgentError::InvalidToolRequest { tool, diagnostic };
                if !recover(agent, &recovery, err, failures, iteration) {
                    return;
                }
            }
            Detection::NoMatch => {
                failures = 0;
                let ctx = CompletionContext {
                    reply: &text,
                    iteration,
                    max_iterations: settings.max_iterations,
                    tool_calls,
                    last_tool_iteration,
                };
                if let Some(reason) = rt.completion.check(&ctx) {
                    succeed(agent, text, iteration, tool_calls, reason);
                    return;
                }
                if iteration <= settings.nudge_iterations {
                    let tools = rt.tools.tools();
                    if let Some(first) = tools.first() {
                        let nudge = planner::encouragement(first.as_ref());
                        if !agent.append(Message::user(nudge)) {
                            return;
                        }
                    }
                }
            }
        }
        agent.record_iteration(iteration, progress_for(iteration, settings.max_iterations));
    }

    // 硬上限：最后一轮以工具调用或失败结束时走到这里
    if agent.is_working() && !cancel.is_cancelled() {
        match last_reply {
            Some(reply) => succeed(
                agent,
                reply,
                last_iteration,
                tool_calls,
                CompletionReason::IterationCeiling {
                    iterations: last_iteration,
                },
            ),
            None => fail(
                agent,
                format!("Iteration limit ({last_iteration}) reached without any model reply"),
            ),
        }
    }
}

/// 处理一次可恢复失败；返回 false 表示循环应结束
fn recover(
    agent: &Agent,
    recovery: &RecoveryEngine,
    err: AgentError,
    failures: usize,
    iteration: usize,
) -> bool {
    match recovery.handle(&err, failures) {
        RecoveryAction::Diagnose(prompt) => {
            agent.emit(AgentEvent::Recovery {
                agent_id: agent.id(),
                iteration,
                action: "diagnose".to_string(),
                detail: preview(&prompt),
            });
            agent.append(Message::user(prompt))
        }
        RecoveryAction::Abort(reason) => {
            agent.emit(AgentEvent::Recovery {
                agent_id: agent.id(),
                iteration,
                action: "abort".to_string(),
                detail: preview(&reason),
            });
            fail(agent, reason);
            false
        }
    }
}

fn succeed(
    agent: &Agent,
    final_reply: String,
    iterations: usize,
    tool_calls: usize,
    reason: CompletionReason,
) {
    let outcome = AgentOutcome {
        final_reply,
        iterations,
        tool_calls,
        reason: reason.clone(),
        conversation_length: agent.conversation().len(),
    };
    if agent.finish_success(outcome) {
        tracing::info!(agent_id = %agent.id(), iterations, tool_calls, reason = ?reason, "agent completed");
        agent.emit(AgentEvent::Completed {
            agent_id: agent.id(),
            iterations,
            reason,
        });
    }
}

fn fail(agent: &Agent, error: String) {
    if agent.finish_failure(error.clone()) {
        tracing::error!(agent_id = %agent.id(), error = %error, "agent failed");
        agent.emit(AgentEvent::Failed {
            agent_id: agent.id(),
            error,
        });
    }
}

/// 终态后写结果记录（配置了 RecordStore 时）
async fn persist(agent: &Agent) {
    let Some(store) = agent.runtime().records.clone() else {
        return;
    };
    let record = agent.record(store.run_id());
    let id = agent.id();
    match tokio::task::spawn_blocking(move || store.save(&record)).await {
        Ok(Ok(path)) => tracing::info!(agent_id = %id, path = %path.display(), "agent record written"),
        Ok(Err(e)) => tracing::warn!(agent_id = %id, error = %e, "failed to write agent record"),
        Err(e) => tracing::warn!(agent_id = %id, error = %e, "record writer task failed"),
    }
}
