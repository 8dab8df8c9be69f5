//! Agent 编排器
//!
//! 负责：创建并登记 Agent、并发准入、状态变化广播、容量回收、任务关系图与后台 worker 监管。
//!
//! 注册表（Agent 表 + TaskGraph）是唯一的共享可变状态，统一由一把锁保护。
//! 加锁顺序固定为 Agent 顺序锁 -> 注册表锁；持有注册表锁时不会触发任何 Agent 的终态迁移与回调。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::agent::{Agent, AgentRuntime, StatusCallback};
use crate::core::definition::{AgentSpec, ResolvedSpec};
use crate::core::error::{AdmissionError, CreationError, OrchestratorError};
use crate::core::state::{AgentId, AgentStatus, StatusChange, StatusCounts};
use crate::core::task_graph::{Direction, TaskGraph};
use crate::llm::{ModelBackend, RateLimitConfig, RateLimiter, RetryConfig, RetryingBackend};
use crate::memory::RecordStore;
use crate::react::completion::CompletionDetector;
use crate::react::events::AgentEvent;
use crate::react::loop_::LoopSettings;
use crate::tools::{ToolExecutor, ToolRegistry, ToolSet};

/// 停止全部时写入的错误
pub const STOPPED_BY_ORCHESTRATOR: &str = "Stopped by orchestrator";

/// 准入与回收参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// 同时处于 Working 的 Agent 上限
    pub max_concurrent_agents: usize,
    /// 登记总数超过此值时触发回收
    pub eviction_high_water: usize,
    /// 回收到此值为止
    pub eviction_low_water: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 5,
            eviction_high_water: 100,
            eviction_low_water: 50,
        }
    }
}

/// 限流器作用范围
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// 整个编排器共用一个限流器
    #[default]
    Shared,
    /// 每个 Agent 一个限流器
    PerAgent,
}

#[derive(Default)]
struct Registry {
    /// id 单调递增，按 key 升序即创建顺序
    agents: BTreeMap<AgentId, Agent>,
    graph: TaskGraph,
    /// 父 -> 直接子任务；取消级联只沿这里走，关系图里的兄弟链不算
    children: BTreeMap<AgentId, Vec<AgentId>>,
}

impl Registry {
    fn working(&self) -> usize {
        self.agents.values().filter(|a| a.is_working()).count()
    }

    fn admit(&self, limit: usize) -> Result<(), AdmissionError> {
        let working = self.working();
        if working >= limit {
            return Err(AdmissionError::CapacityReached { limit, working });
        }
        Ok(())
    }

    /// 挂到父节点下；父节点 Down/Right 都已占用时接到 Down 链末尾
    fn link_children(&mut self, parent: AgentId, children: &[AgentId]) {
        self.children
            .entry(parent)
            .or_default()
            .extend(children.iter().copied().filter(|c| *c != parent));
        if self.graph.add_children(parent, children).is_some() {
            return;
        }
        let mut prev = self
            .graph
            .chain(parent, Direction::Down)
            .last()
            .copied()
            .unwrap_or(parent);
        for child in children {
            if self.graph.set_relation(prev, Direction::Down, *child).is_ok() {
                prev = *child;
            }
        }
    }

    /// 回收最早创建的终态 Agent，直到不超过低水位
    fn evict(&mut self, config: &OrchestratorConfig) -> Vec<AgentId> {
        if self.agents.len() <= config.eviction_high_water {
            return Vec::new();
        }
        let excess = self.agents.len().saturating_sub(config.eviction_low_water);
        let victims: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|(_, a)| a.status().is_terminal())
            .map(|(id, _)| *id)
            .take(excess)
            .collect();
        for id in &victims {
            self.agents.remove(id);
            self.graph.remove(*id);
            self.children.remove(id);
        }
        if !victims.is_empty() {
            self.children.retain(|_, kids| {
                kids.retain(|k| !victims.contains(k));
                !kids.is_empty()
            });
        }
        victims
    }
}

pub(crate) struct OrchestratorInner {
    config: OrchestratorConfig,
    registry: Mutex<Registry>,
    tools: Arc<ToolRegistry>,
    backend: Arc<dyn ModelBackend>,
    retry: RetryConfig,
    rate_limit: RateLimitConfig,
    scope: RateLimitScope,
    shared_limiter: Arc<RateLimiter>,
    executor: ToolExecutor,
    settings: LoopSettings,
    completion: Arc<dyn CompletionDetector>,
    records: Option<RecordStore>,
    events: broadcast::Sender<AgentEvent>,
    observers: Mutex<Vec<StatusCallback>>,
    workers: Mutex<Vec<JoinHandle<AgentStatus>>>,
}

/// 编排器句柄（可克隆，共享同一注册表）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

/// 不延长编排器生命周期的弱引用（供 agent_creator 等工具持有）
#[derive(Clone, Default)]
pub struct WeakOrchestrator {
    inner: Weak<OrchestratorInner>,
}

impl WeakOrchestrator {
    pub fn upgrade(&self) -> Option<Orchestrator> {
        self.inner.upgrade().map(|inner| Orchestrator { inner })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("agents", &self.len())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 构造所需的全部部件（由 OrchestratorBuilder 组装）
pub(crate) struct Parts {
    pub config: OrchestratorConfig,
    pub backend: Arc<dyn ModelBackend>,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub scope: RateLimitScope,
    pub executor: ToolExecutor,
    pub settings: LoopSettings,
    pub completion: Arc<dyn CompletionDetector>,
    pub records: Option<RecordStore>,
    pub event_capacity: usize,
}

impl Orchestrator {
    /// 注册表在弱引用建立后才生成，工具可以持有编排器的弱引用
    pub(crate) fn from_parts(
        parts: Parts,
        make_tools: impl FnOnce(WeakOrchestrator) -> ToolRegistry,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<OrchestratorInner>| {
            let tools = make_tools(WeakOrchestrator { inner: weak.clone() });
            let (events, _) = broadcast::channel(parts.event_capacity.max(1));
            OrchestratorInner {
                config: parts.config,
                registry: Mutex::new(Registry::default()),
                tools: Arc::new(tools),
                backend: parts.backend,
                retry: parts.retry,
                shared_limiter: Arc::new(RateLimiter::new(parts.rate_limit)),
                rate_limit: parts.rate_limit,
                scope: parts.scope,
                executor: parts.executor,
                settings: parts.settings,
                completion: parts.completion,
                records: parts.records,
                events,
                observers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }
        });
        tracing::info!(
            max_concurrent = inner.config.max_concurrent_agents,
            tools = ?inner.tools.tool_names(),
            scope = ?inner.scope,
            "orchestrator ready"
        );
        Self { inner }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    /// 结果记录目录（配置了 results_dir 时）
    pub fn records(&self) -> Option<&RecordStore> {
        self.inner.records.as_ref()
    }

    pub fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 订阅所有 Agent 的过程事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// 注册编排器级观察者：所有已登记 Agent 的状态迁移都会转发给它
    pub fn add_observer(&self, observer: StatusCallback) {
        lock(&self.inner.observers).push(observer);
    }

    /// 新建并登记 Pending 状态的 Agent（不启动）
    pub fn create_agent(&self, spec: AgentSpec) -> Result<Agent, OrchestratorError> {
        let agent = self.build_agent(spec.resolve()?);
        {
            let mut reg = lock(&self.inner.registry);
            reg.admit(self.inner.config.max_concurrent_agents)?;
            self.register_locked(&mut reg, &agent)?;
        }
        tracing::info!(agent_id = %agent.id(), name = %agent.name(), "agent created");
        Ok(agent)
    }

    /// 新建、登记并立即启动；准入检查与 Pending->Working 在同一次注册表加锁内完成
    pub fn spawn_agent(&self, spec: AgentSpec) -> Result<Agent, OrchestratorError> {
        let agent = self.build_agent(spec.resolve()?);
        {
            let _order = agent.order_guard();
            let change = {
                let mut reg = lock(&self.inner.registry);
                reg.admit(self.inner.config.max_concurrent_agents)?;
                self.register_locked(&mut reg, &agent)?;
                Self::start_locked(&agent)?
            };
            agent.notify(&change);
        }
        tracing::info!(agent_id = %agent.id(), name = %agent.name(), "agent spawned");
        self.track(agent.launch());
        Ok(agent)
    }

    /// 启动一个已登记的 Pending Agent
    pub fn start(&self, id: AgentId) -> Result<Agent, OrchestratorError> {
        let agent = self.get(id).ok_or(OrchestratorError::UnknownAgent(id))?;
        {
            let _order = agent.order_guard();
            let change = {
                let reg = lock(&self.inner.registry);
                if !reg.agents.contains_key(&id) {
                    return Err(OrchestratorError::UnknownAgent(id));
                }
                reg.admit(self.inner.config.max_concurrent_agents)?;
                Self::start_locked(&agent)?
            };
            agent.notify(&change);
        }
        self.track(agent.launch());
        Ok(agent)
    }

    /// 批量创建子任务并在关系图中挂到 parent 下（兄弟依次串联），不启动
    pub fn create_children(
        &self,
        parent: AgentId,
        specs: Vec<AgentSpec>,
    ) -> Result<Vec<Agent>, OrchestratorError> {
        let resolved = specs
            .into_iter()
            .map(|s| s.resolve())
            .collect::<Result<Vec<ResolvedSpec>, CreationError>>()?;
        let agents: Vec<Agent> = resolved
            .into_iter()
            .map(|mut r| {
                r.parent = Some(parent);
                self.build_agent(r)
            })
            .collect();
        {
            let mut reg = lock(&self.inner.registry);
            if !reg.agents.contains_key(&parent) {
                return Err(CreationError::UnknownParent(parent).into());
            }
            reg.admit(self.inner.config.max_concurrent_agents)?;
            for agent in &agents {
                reg.agents.insert(agent.id(), agent.clone());
                reg.graph.add_task(agent.id());
            }
            let ids: Vec<AgentId> = agents.iter().map(Agent::id).collect();
            reg.link_children(parent, &ids);
            let evicted = reg.evict(&self.inner.config);
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "evicted finished agents");
            }
        }
        tracing::info!(parent = %parent, count = agents.len(), "child agents created");
        Ok(agents)
    }

    pub fn get(&self, id: AgentId) -> Option<Agent> {
        lock(&self.inner.registry).agents.get(&id).cloned()
    }

    /// 全部 Agent，最新创建的在前
    pub fn list(&self) -> Vec<Agent> {
        lock(&self.inner.registry).agents.values().rev().cloned().collect()
    }

    pub fn by_status(&self, status: AgentStatus) -> Vec<Agent> {
        lock(&self.inner.registry)
            .agents
            .values()
            .rev()
            .filter(|a| a.status() == status)
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> StatusCounts {
        let reg = lock(&self.inner.registry);
        let mut counts = StatusCounts::default();
        for agent in reg.agents.values() {
            counts.add(agent.status());
        }
        counts
    }

    pub fn working_count(&self) -> usize {
        lock(&self.inner.registry).working()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.registry).agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关系图快照
    pub fn graph(&self) -> TaskGraph {
        lock(&self.inner.registry).graph.clone()
    }

    /// 取消 Agent；只有它本身确实由 Working 变为 Cancelled 时，才继续取消它的直接子任务（逐层递归）。
    /// 兄弟任务不受影响。返回实际被取消的 id
    pub fn cancel(&self, id: AgentId) -> Vec<AgentId> {
        let mut cancelled = Vec::new();
        let mut pending = vec![id];
        while let Some(cur) = pending.pop() {
            let (agent, children) = {
                let reg = lock(&self.inner.registry);
                (
                    reg.agents.get(&cur).cloned(),
                    reg.children.get(&cur).cloned().unwrap_or_default(),
                )
            };
            if agent.is_some_and(|a| a.cancel()) {
                cancelled.push(cur);
                pending.extend(children);
            }
        }
        if !cancelled.is_empty() {
            tracing::info!(root = %id, cancelled = ?cancelled, "agents cancelled");
        }
        cancelled
    }

    /// 把所有 Working 的 Agent 置为 Failed；返回被停止的数量
    pub fn stop_all(&self) -> usize {
        let stopped = self
            .by_status(AgentStatus::Working)
            .iter()
            .filter(|a| a.stop(STOPPED_BY_ORCHESTRATOR))
            .count();
        if stopped > 0 {
            tracing::warn!(stopped, "all working agents stopped");
        }
        stopped
    }

    /// 等待当前所有后台 worker 退出（含结果记录写入），不改变任何状态
    pub async fn join(&self) {
        loop {
            let workers: Vec<JoinHandle<AgentStatus>> =
                lock(&self.inner.workers).drain(..).collect();
            if workers.is_empty() {
                return;
            }
            for handle in workers {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "agent worker ended abnormally");
                }
            }
        }
    }

    /// 停止全部并等待所有后台 worker 退出
    pub async fn shutdown(&self) -> usize {
        let stopped = self.stop_all();
        self.join().await;
        tracing::info!(stopped, "orchestrator shut down");
        stopped
    }

    fn build_agent(&self, spec: ResolvedSpec) -> Agent {
        let inner = &self.inner;
        let tools = match &spec.tools {
            Some(names) => ToolSet::only(inner.tools.clone(), names),
            None => ToolSet::all(inner.tools.clone()),
        };
        let limiter = match inner.scope {
            RateLimitScope::Shared => inner.shared_limiter.clone(),
            RateLimitScope::PerAgent => Arc::new(RateLimiter::new(inner.rate_limit)),
        };
        let runtime = AgentRuntime {
            backend: RetryingBackend::new(inner.backend.clone(), limiter, inner.retry),
            tools,
            executor: inner.executor.clone(),
            settings: inner.settings.clone(),
            completion: inner.completion.clone(),
            events: Some(inner.events.clone()),
            records: inner.records.clone(),
        };
        let agent = Agent::new(spec, runtime);
        let weak = self.downgrade();
        agent.on_status_change(Arc::new(move |agent: &Agent, change: &StatusChange| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_agent_status(agent, change);
            }
        }));
        agent
    }

    fn register_locked(&self, reg: &mut Registry, agent: &Agent) -> Result<(), OrchestratorError> {
        let parent = agent.spec().parent;
        if let Some(parent) = parent {
            if !reg.agents.contains_key(&parent) {
                return Err(CreationError::UnknownParent(parent).into());
            }
        }
        reg.agents.insert(agent.id(), agent.clone());
        reg.graph.add_task(agent.id());
        if let Some(parent) = parent {
            reg.link_children(parent, &[agent.id()]);
        }
        let evicted = reg.evict(&self.inner.config);
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted finished agents");
        }
        Ok(())
    }

    fn start_locked(agent: &Agent) -> Result<StatusChange, OrchestratorError> {
        agent
            .apply_transition(AgentStatus::Working, |_| {})
            .map_err(|_| OrchestratorError::NotStartable {
                id: agent.id(),
                status: agent.status(),
            })
    }

    fn track(&self, handle: JoinHandle<AgentStatus>) {
        let mut workers = lock(&self.inner.workers);
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    /// 每个 Agent 的内部回调：转发给观察者，终态时检查容量
    fn on_agent_status(&self, agent: &Agent, change: &StatusChange) {
        let observers = lock(&self.inner.observers).clone();
        for observer in observers {
            observer(agent, change);
        }
        if change.to.is_terminal() {
            let evicted = lock(&self.inner.registry).evict(&self.inner.config);
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "evicted finished agents");
            }
        }
    }
}
