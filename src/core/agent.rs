//! Agent：状态机 + 私有对话 + 运行时依赖
//!
//! Agent 是可克隆的句柄（内部 Arc），编排器是唯一的长期持有者，调用方拿到的是同一份状态的引用。
//! 每次状态迁移在同一把顺序锁内完成「改状态 + 通知回调」，保证同一 Agent 的迁移按序送达观察者。
//! 观察者回调里不要同步地再去迁移同一个 Agent。

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::definition::ResolvedSpec;
use crate::core::error::AgentError;
use crate::core::state::{AgentId, AgentSnapshot, AgentStatus, StatusChange};
use crate::llm::RetryingBackend;
use crate::memory::{AgentRecord, ConversationStore, Message, RecordStore};
use crate::react::completion::CompletionDetector;
use crate::react::events::AgentEvent;
use crate::react::loop_::LoopSettings;
use crate::react::planner;
use crate::tools::{ToolExecutor, ToolSet, ToolUsage};

pub use crate::react::completion::CompletionReason;

/// 成功时的结构化结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentOutcome {
    pub final_reply: String,
    pub iterations: usize,
    pub tool_calls: usize,
    pub reason: CompletionReason,
    pub conversation_length: usize,
}

/// 状态迁移回调
pub type StatusCallback = Arc<dyn Fn(&Agent, &StatusChange) + Send + Sync>;

/// 循环运行所需的依赖
#[derive(Clone)]
pub struct AgentRuntime {
    pub backend: RetryingBackend,
    pub tools: ToolSet,
    pub executor: ToolExecutor,
    pub settings: LoopSettings,
    pub completion: Arc<dyn CompletionDetector>,
    pub events: Option<broadcast::Sender<AgentEvent>>,
    pub records: Option<RecordStore>,
}

#[derive(Debug)]
pub(crate) struct AgentState {
    status: AgentStatus,
    conversation: ConversationStore,
    result: Option<AgentOutcome>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    progress: u8,
    iterations: usize,
    tool_usage: Vec<ToolUsage>,
}

struct AgentInner {
    id: AgentId,
    spec: ResolvedSpec,
    state: Mutex<AgentState>,
    callbacks: Mutex<Vec<StatusCallback>>,
    order: Mutex<()>,
    cancel: CancellationToken,
    status_tx: watch::Sender<AgentStatus>,
    runtime: AgentRuntime,
}

/// Agent 句柄
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("name", &self.inner.spec.name)
            .field("status", &self.status())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Agent {
    /// 新建 Pending 状态的 Agent，对话以 system prompt + 任务指令开局
    pub fn new(spec: ResolvedSpec, runtime: AgentRuntime) -> Self {
        let system = planner::system_prompt(&spec, &runtime.tools.tools());
        let conversation = ConversationStore::seeded(system, planner::task_message(&spec));
        let (status_tx, _) = watch::channel(AgentStatus::Pending);
        Self {
            inner: Arc::new(AgentInner {
                id: AgentId::next(),
                spec,
                state: Mutex::new(AgentState {
                    status: AgentStatus::Pending,
                    conversation,
                    result: None,
                    error: None,
                    started_at: None,
                    ended_at: None,
                    progress: 0,
                    iterations: 0,
                    tool_usage: Vec::new(),
                }),
                callbacks: Mutex::new(Vec::new()),
                order: Mutex::new(()),
                cancel: CancellationToken::new(),
                status_tx,
                runtime,
            }),
        }
    }

    pub fn id(&self) -> AgentId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn description(&self) -> &str {
        &self.inner.spec.description
    }

    pub fn spec(&self) -> &ResolvedSpec {
        &self.inner.spec
    }

    pub fn status(&self) -> AgentStatus {
        lock(&self.inner.state).status
    }

    pub fn is_working(&self) -> bool {
        self.status() == AgentStatus::Working
    }

    pub fn conversation(&self) -> Vec<Message> {
        lock(&self.inner.state).conversation.messages().to_vec()
    }

    pub fn result(&self) -> Option<AgentOutcome> {
        lock(&self.inner.state).result.clone()
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.inner.state).error.clone()
    }

    pub fn progress(&self) -> u8 {
        lock(&self.inner.state).progress
    }

    pub fn iterations(&self) -> usize {
        lock(&self.inner.state).iterations
    }

    pub fn tool_usage(&self) -> Vec<ToolUsage> {
        lock(&self.inner.state).tool_usage.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).ended_at
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let st = lock(&self.inner.state);
        AgentSnapshot {
            id: self.inner.id,
            name: self.inner.spec.name.clone(),
            description: self.inner.spec.description.clone(),
            status: st.status,
            progress: st.progress,
            iterations: st.iterations,
            tool_calls: st.tool_usage.len(),
            error: st.error.clone(),
            started_at: st.started_at,
            ended_at: st.ended_at,
        }
    }

    /// 当前状态的持久化记录
    pub fn record(&self, run_id: Uuid) -> AgentRecord {
        let st = lock(&self.inner.state);
        let execution_secs = match (st.started_at, st.ended_at) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        AgentRecord {
            id: self.inner.id,
            run_id,
            name: self.inner.spec.name.clone(),
            description: self.inner.spec.description.clone(),
            status: st.status,
            progress: st.progress,
            started_at: st.started_at,
            ended_at: st.ended_at,
            execution_secs,
            result: st.result.clone(),
            error: st.error.clone(),
            tool_usage: st.tool_usage.clone(),
            conversation: st.conversation.messages().to_vec(),
        }
    }

    /// 注册状态迁移回调
    pub fn on_status_change(&self, callback: StatusCallback) {
        lock(&self.inner.callbacks).push(callback);
    }

    /// Working -> Cancelled；对非 Working 的 Agent 无效果
    pub fn cancel(&self) -> bool {
        let changed = self
            .transition(AgentStatus::Cancelled, |_| {})
            .is_ok();
        if changed {
            self.inner.cancel.cancel();
        }
        changed
    }

    /// Working -> Failed（编排器强制停止）
    pub fn stop(&self, reason: &str) -> bool {
        let reason = reason.to_string();
        let changed = self
            .transition(AgentStatus::Failed, move |st| st.error = Some(reason))
            .is_ok();
        if changed {
            self.inner.cancel.cancel();
        }
        changed
    }

    /// 等待进入终态
    pub async fn wait(&self) -> AgentStatus {
        let mut rx = self.inner.status_tx.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    pub(crate) fn runtime(&self) -> &AgentRuntime {
        &self.inner.runtime
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// 顺序锁：持有期间本 Agent 的其他迁移会等待
    pub(crate) fn order_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner.order)
    }

    pub(crate) fn launch(&self) -> JoinHandle<AgentStatus> {
        tokio::spawn(crate::react::loop_::run(self.clone()))
    }

    /// 只改状态不通知；调用方必须持有 order_guard 并随后调用 notify
    pub(crate) fn apply_transition(
        &self,
        to: AgentStatus,
        apply: impl FnOnce(&mut AgentState),
    ) -> Result<StatusChange, AgentError> {
        let mut st = lock(&self.inner.state);
        let from = st.status;
        if !from.can_transition_to(to) {
            return Err(AgentError::InvalidTransition {
                id: self.inner.id,
                from,
                to,
            });
        }
        let now = Utc::now();
        st.status = to;
        if to == AgentStatus::Working {
            st.started_at = Some(now);
        } else {
            st.ended_at = Some(now.max(st.started_at.unwrap_or(now)));
        }
        apply(&mut st);
        Ok(StatusChange {
            agent_id: self.inner.id,
            from,
            to,
            at: now,
        })
    }

    pub(crate) fn notify(&self, change: &StatusChange) {
        tracing::info!(
            agent_id = %change.agent_id,
            name = %self.inner.spec.name,
            from = %change.from,
            to = %change.to,
            "agent status changed"
        );
        self.emit(AgentEvent::StatusChanged {
            agent_id: change.agent_id,
            from: change.from,
            to: change.to,
        });
        let callbacks = lock(&self.inner.callbacks).clone();
        for cb in callbacks {
            cb(self, change);
        }
        // 回调全部执行完才唤醒 wait()
        self.inner.status_tx.send_replace(change.to);
    }

    fn transition(
        &self,
        to: AgentStatus,
        apply: impl FnOnce(&mut AgentState),
    ) -> Result<StatusChange, AgentError> {
        let _order = self.order_guard();
        let change = self.apply_transition(to, apply)?;
        self.notify(&change);
        Ok(change)
    }

    /// 追加消息；Agent 已不在 Working 时丢弃并返回 false
    pub(crate) fn append(&self, msg: Message) -> bool {
        let mut st = lock(&self.inner.state);
        if st.status != AgentStatus::Working {
            return false;
        }
        st.conversation.append(msg);
        true
    }

    pub(crate) fn record_iteration(&self, iteration: usize, progress: u8) {
        let mut st = lock(&self.inner.state);
        st.iterations = iteration;
        st.progress = st.progress.max(progress.min(100));
    }

    pub(crate) fn push_tool_usage(&self, usage: ToolUsage) {
        lock(&self.inner.state).tool_usage.push(usage);
    }

    pub(crate) fn finish_success(&self, outcome: AgentOutcome) -> bool {
        self.transition(AgentStatus::Success, move |st| {
            st.progress = 100;
            st.result = Some(outcome);
        })
        .is_ok()
    }

    pub(crate) fn finish_failure(&self, error: String) -> bool {
        let error = if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        };
        self.transition(AgentStatus::Failed, move |st| st.error = Some(error))
            .is_ok()
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.inner.runtime.events {
            let _ = tx.send(event);
        }
    }
}
