//! 对话循环集成测试：完成判定、迭代上限、工具调用、失败恢复、流式回退与结果记录

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor::core::{
    Agent, AgentSpec, AgentStatus, CompletionReason, Orchestrator, OrchestratorBuilder,
    RateLimitScope,
};
use conductor::llm::{ChatRequest, LlmError, ModelBackend, RateLimitConfig, ScriptedBackend};
use conductor::memory::{RecordStore, Role};
use conductor::react::{AgentEvent, LoopSettings};
use conductor::tools::EchoTool;

const SEARCH_BLOCK: &str = "Searching now.\n<tool name=\"web_search\">\n  <query>site:example.com security</query>\n</tool>";

fn no_spacing() -> RateLimitConfig {
    RateLimitConfig {
        min_interval: Duration::ZERO,
        ..RateLimitConfig::default()
    }
}

fn builder(backend: Arc<dyn ModelBackend>) -> OrchestratorBuilder {
    OrchestratorBuilder::new(backend).rate_limit(no_spacing(), RateLimitScope::Shared)
}

fn search_orchestrator(backend: Arc<dyn ModelBackend>) -> Orchestrator {
    builder(backend).tool(EchoTool::named("web_search")).build()
}

async fn run_one(orchestrator: &Orchestrator, spec: AgentSpec) -> Agent {
    let agent = orchestrator.spawn_agent(spec).unwrap();
    agent.wait().await;
    agent
}

fn spec(name: &str) -> AgentSpec {
    AgentSpec::new(name).with_instructions("Investigate example.com")
}

#[tokio::test]
async fn test_task_completed_on_first_reply() {
    let backend = Arc::new(ScriptedBackend::always("Here is the answer. Task completed."));
    let o = search_orchestrator(backend.clone());
    let agent = run_one(&o, spec("quick")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    assert_eq!(agent.iterations(), 1);
    assert_eq!(backend.calls(), 1);
    let result = agent.result().unwrap();
    assert_eq!(result.iterations, 1);
    assert_eq!(result.reason, CompletionReason::StrongPhrase("task completed".into()));
    assert_eq!(agent.progress(), 100);
    assert!(agent.error().is_none());

    let conv = agent.conversation();
    assert_eq!(conv.len(), 3);
    assert_eq!(conv[0].role, Role::System);
    assert_eq!(conv[1].role, Role::User);
    assert_eq!(conv[2].role, Role::Assistant);
    assert!(agent.started_at().unwrap() <= agent.ended_at().unwrap());
}

#[tokio::test]
async fn test_narration_stops_exactly_at_ceiling() {
    let backend = Arc::new(ScriptedBackend::always("I am still thinking about the problem."));
    let o = search_orchestrator(backend.clone());
    let agent = run_one(&o, spec("thinker")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    assert_eq!(backend.calls(), 15);
    assert_eq!(agent.iterations(), 15);
    assert_eq!(
        agent.result().unwrap().reason,
        CompletionReason::IterationCeiling { iterations: 15 }
    );
    // 前 3 轮没有工具调用，各追加一条使用提示
    let nudges = agent
        .conversation()
        .iter()
        .filter(|m| m.role == Role::User && m.content.contains("You have tools available"))
        .count();
    assert_eq!(nudges, 3);
}

#[tokio::test]
async fn test_web_search_every_turn_logs_each_tool_call() {
    let backend = Arc::new(ScriptedBackend::always(SEARCH_BLOCK));
    let o = search_orchestrator(backend.clone());
    let agent = run_one(&o, spec("searcher")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    let result = agent.result().unwrap();
    let usage = agent.tool_usage();
    assert_eq!(usage.len(), result.iterations);
    assert_eq!(usage.len(), result.tool_calls);
    assert_eq!(result.iterations, 15);
    assert!(usage.iter().all(|u| u.success && u.tool == "web_search"));
    assert_eq!(usage[0].parameters.get("query").unwrap(), "site:example.com security");

    // 工具输出作为下一条 User 消息
    let conv = agent.conversation();
    assert!(conv[3].content.starts_with("Tool 'web_search' executed successfully."));
    assert!(conv[3].content.contains("site:example.com security"));
}

#[tokio::test]
async fn test_soft_rule_stops_after_idle_turns() {
    let mut script: Vec<Result<String, LlmError>> = vec![Ok(SEARCH_BLOCK.to_string()); 8];
    script.push(Ok("Still reviewing the data.".to_string()));
    let backend = Arc::new(ScriptedBackend::new(script).repeat_last());
    let o = search_orchestrator(backend);
    let agent = run_one(&o, spec("soft")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    // 最后一次工具在第 8 轮；第 11 轮超过阈值且已空闲 3 轮
    assert_eq!(
        agent.result().unwrap().reason,
        CompletionReason::IdleAfterTools { iteration: 11 }
    );
    assert_eq!(agent.tool_usage().len(), 8);
}

#[tokio::test]
async fn test_missing_parameter_aborts_after_three_failures() {
    let backend = Arc::new(ScriptedBackend::always(
        "<tool name=\"WEB_SEARCH\"><page>2</page></tool>",
    ));
    let o = search_orchestrator(backend.clone());
    let agent = run_one(&o, spec("broken")).await;

    assert_eq!(agent.status(), AgentStatus::Failed);
    assert_eq!(backend.calls(), 3);
    let error = agent.error().unwrap();
    assert!(error.contains("Aborted after 3 consecutive failures"));
    assert!(error.contains("missing required parameter 'query'"));
    assert!(agent.result().is_none());
    // 前两次的诊断作为 User 消息注入
    let diagnostics = agent
        .conversation()
        .iter()
        .filter(|m| m.role == Role::User && m.content.contains("received: [page]"))
        .count();
    assert_eq!(diagnostics, 2);
    assert!(agent.tool_usage().is_empty());
}

#[tokio::test]
async fn test_tool_failure_is_recoverable() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok("<tool name=\"echo\"><other>x</other></tool>".to_string()),
        Ok("Recovered. Final results: nothing to echo.".to_string()),
    ]));
    let o = builder(backend).tool(EchoTool::new()).build();
    let agent = run_one(&o, spec("echoer")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    let usage = agent.tool_usage();
    assert_eq!(usage.len(), 1);
    assert!(!usage[0].success);
    assert!(agent.conversation()[3]
        .content
        .starts_with("Tool 'echo' encountered an error: invalid argument"));
}

#[tokio::test]
async fn test_backend_rejection_fails_verbatim() {
    let backend = Arc::new(ScriptedBackend::new(vec![Err(LlmError::Rejected(
        "status 401: invalid api key".into(),
    ))]));
    let o = search_orchestrator(backend.clone());
    let agent = run_one(&o, spec("rejected")).await;

    assert_eq!(agent.status(), AgentStatus::Failed);
    assert_eq!(
        agent.error().unwrap(),
        "LLM error: backend rejected the request: status 401: invalid api key"
    );
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_empty_replies_become_diagnostics_then_abort() {
    let backend = Arc::new(ScriptedBackend::always("   "));
    let o = search_orchestrator(backend);
    let agent = run_one(&o, spec("silent")).await;

    assert_eq!(agent.status(), AgentStatus::Failed);
    assert!(agent.error().unwrap().contains("empty response"));
    let diagnostics = agent
        .conversation()
        .iter()
        .filter(|m| m.content.starts_with("Error occurred:"))
        .count();
    assert_eq!(diagnostics, 2);
}

struct DownBackend;

#[async_trait]
impl ModelBackend for DownBackend {
    fn name(&self) -> &str {
        "down"
    }

    async fn send(&self, _request: &ChatRequest) -> Result<String, LlmError> {
        Ok("task completed".to_string())
    }

    async fn health(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_unhealthy_backend_fails_before_first_call() {
    let o = search_orchestrator(Arc::new(DownBackend));
    let agent = run_one(&o, spec("offline")).await;
    assert_eq!(agent.status(), AgentStatus::Failed);
    assert_eq!(agent.error().unwrap(), "API server is not available");
    assert_eq!(agent.iterations(), 0);
}

#[tokio::test]
async fn test_stream_chunks_concatenate_and_fall_back_midway() {
    let backend = Arc::new(
        ScriptedBackend::new(vec![Ok("Final results: fallback reply".to_string())])
            .with_stream(vec![
                Ok("partial ".to_string()),
                Err(LlmError::Stream("connection reset".into())),
            ]),
    );
    let o = builder(backend.clone())
        .settings(LoopSettings {
            stream: true,
            ..LoopSettings::default()
        })
        .build();
    let agent = run_one(&o, spec("streamer")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    assert_eq!(agent.result().unwrap().final_reply, "Final results: fallback reply");
    assert_eq!(backend.stream_calls(), 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_disabled_tool_is_invisible() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(SEARCH_BLOCK.to_string()),
        Ok("task completed".to_string()),
    ]));
    let o = builder(backend)
        .tool(EchoTool::named("web_search"))
        .disable("web_search")
        .build();
    let agent = run_one(&o, spec("muted")).await;

    assert_eq!(agent.status(), AgentStatus::Success);
    assert_eq!(agent.iterations(), 2);
    assert!(agent.tool_usage().is_empty());
}

#[tokio::test]
async fn test_events_follow_the_loop() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(SEARCH_BLOCK.to_string()),
        Ok("Task completed with final results.".to_string()),
    ]));
    let o = search_orchestrator(backend);
    let mut rx = o.subscribe_events();
    let agent = o.spawn_agent(spec("observed")).unwrap();
    // Completed 在状态迁移之后发出；等 worker 退出再读
    o.join().await;
    assert_eq!(agent.status(), AgentStatus::Success);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.agent_id(), agent.id());
        kinds.push(match event {
            AgentEvent::StatusChanged { .. } => "status",
            AgentEvent::IterationStarted { .. } => "iteration",
            AgentEvent::Reply { .. } => "reply",
            AgentEvent::ToolCall { .. } => "tool",
            AgentEvent::Observation { .. } => "observation",
            AgentEvent::Recovery { .. } => "recovery",
            AgentEvent::Completed { .. } => "completed",
            AgentEvent::Failed { .. } => "failed",
        });
    }
    assert_eq!(
        kinds,
        vec![
            "status",
            "iteration",
            "reply",
            "tool",
            "observation",
            "iteration",
            "reply",
            "status",
            "completed"
        ]
    );
}

#[tokio::test]
async fn test_record_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::new(dir.path());
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(SEARCH_BLOCK.to_string()),
        Ok("Task completed.".to_string()),
    ]));
    let o = builder(backend)
        .tool(EchoTool::named("web_search"))
        .records(store.clone())
        .build();
    let agent = o.spawn_agent(spec("recorded")).unwrap();
    // 等 worker 写完记录
    o.join().await;
    assert_eq!(agent.status(), AgentStatus::Success);

    let files = store.list().unwrap();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with(&format!("agent_{}_", agent.id())));

    let loaded = store.load(&files[0]).unwrap();
    let live = agent.record(store.run_id());
    assert_eq!(loaded.id, live.id);
    assert_eq!(loaded.status, AgentStatus::Success);
    assert_eq!(loaded.result, live.result);
    assert_eq!(loaded.error, None);
    assert_eq!(loaded.conversation, live.conversation);
    assert_eq!(loaded.tool_usage, live.tool_usage);
    assert_eq!(loaded.started_at, live.started_at);
    assert_eq!(loaded.ended_at, live.ended_at);
}
