//! 编排器构建器：统一的组件初始化逻辑
//!
//! CLI、集成测试与嵌入方都通过这里组装后端、工具注册表、限流重试参数与循环参数，
//! 保证所有入口拿到同一套工具与默认值。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::orchestrator::{Orchestrator, OrchestratorConfig, Parts, RateLimitScope};
use crate::llm::{
    GatewayBackend, LlmError, MockBackend, ModelBackend, RateLimitConfig, RetryConfig,
};
use crate::memory::RecordStore;
use crate::react::completion::{CompletionDetector, PhraseCompletionDetector};
use crate::react::loop_::LoopSettings;
use crate::tools::{AgentCreatorTool, Tool, ToolExecutor, ToolRegistry};

/// 根据配置选择后端：mock 或 HTTP 网关
pub fn build_backend(cfg: &AppConfig, mock: bool) -> Result<Arc<dyn ModelBackend>, LlmError> {
    if mock {
        tracing::info!("Using mock backend");
        return Ok(Arc::new(MockBackend));
    }
    tracing::info!(base_url = %cfg.backend.base_url, model = %cfg.backend.model, "Using gateway backend");
    Ok(Arc::new(GatewayBackend::new(cfg.backend.gateway_config())?))
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    backend: Arc<dyn ModelBackend>,
    config: OrchestratorConfig,
    retry: RetryConfig,
    rate_limit: RateLimitConfig,
    scope: RateLimitScope,
    executor: ToolExecutor,
    settings: LoopSettings,
    completion: Arc<dyn CompletionDetector>,
    records: Option<RecordStore>,
    event_capacity: usize,
    tools: Vec<Arc<dyn Tool>>,
    disabled: Vec<String>,
    agent_creator: bool,
}

impl OrchestratorBuilder {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            config: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            scope: RateLimitScope::default(),
            executor: ToolExecutor::default(),
            settings: LoopSettings::default(),
            completion: Arc::new(PhraseCompletionDetector::default()),
            records: None,
            event_capacity: 256,
            tools: Vec::new(),
            disabled: Vec::new(),
            agent_creator: false,
        }
    }

    /// 从应用配置取全部参数
    pub fn from_config(cfg: &AppConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let mut builder = Self::new(backend)
            .config(cfg.orchestrator_config())
            .retry(cfg.retry_config())
            .rate_limit(cfg.rate_limit_config(), cfg.rate_limit.scope)
            .executor(cfg.tool_executor())
            .settings(cfg.loop_settings())
            .completion(Arc::new(PhraseCompletionDetector::new(
                cfg.agent.soft_iteration_threshold,
                cfg.agent.idle_tool_window,
            )));
        if let Some(dir) = &cfg.app.results_dir {
            builder = builder.records(RecordStore::new(dir));
        }
        for name in &cfg.tools.disabled {
            builder = builder.disable(name);
        }
        builder
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig, scope: RateLimitScope) -> Self {
        self.rate_limit = rate_limit;
        self.scope = scope;
        self
    }

    pub fn executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 替换完成判定器
    pub fn completion(mut self, completion: Arc<dyn CompletionDetector>) -> Self {
        self.completion = completion;
        self
    }

    pub fn records(mut self, store: RecordStore) -> Self {
        self.records = Some(store);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// 按调用顺序注册工具（检测平局时按此顺序）
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn disable(mut self, name: impl Into<String>) -> Self {
        self.disabled.push(name.into());
        self
    }

    /// 注册 agent_creator 工具（只对在 tools 中显式列出它的 Agent 可见）
    pub fn with_agent_creator(mut self) -> Self {
        self.agent_creator = true;
        self
    }

    pub fn build(self) -> Orchestrator {
        let parts = Parts {
            config: self.config,
            backend: self.backend,
            retry: self.retry,
            rate_limit: self.rate_limit,
            scope: self.scope,
            executor: self.executor,
            settings: self.settings,
            completion: self.completion,
            records: self.records,
            event_capacity: self.event_capacity,
        };
        let tools = self.tools;
        let disabled = self.disabled;
        let agent_creator = self.agent_creator;
        Orchestrator::from_parts(parts, move |weak| {
            let mut registry = ToolRegistry::new();
            for tool in tools {
                registry.register_arc(tool);
            }
            if agent_creator {
                registry.register(AgentCreatorTool::new(weak));
            }
            for name in &disabled {
                registry.set_enabled(name, false);
            }
            registry
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_build_from_config_applies_disabled_tools() {
        let mut cfg = AppConfig::default();
        cfg.tools.disabled = vec!["echo".to_string()];
        cfg.orchestrator.max_concurrent_agents = 2;
        let o = OrchestratorBuilder::from_config(&cfg, Arc::new(MockBackend))
            .tool(EchoTool::new())
            .tool(EchoTool::named("web_search"))
            .with_agent_creator()
            .build();
        assert_eq!(o.config().max_concurrent_agents, 2);
        assert!(!o.tools().is_enabled("echo"));
        assert!(o.tools().is_enabled("web_search"));
        assert!(o.tools().get("agent_creator").is_some());
    }

    #[test]
    fn test_mock_backend_selection() {
        let backend = build_backend(&AppConfig::default(), true).unwrap();
        assert_eq!(backend.name(), "mock");
    }
}
