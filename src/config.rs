//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再读显式指定的文件，最后用环境变量 `CONDUCTOR__*` 覆盖
//! （双下划线表示嵌套，如 `CONDUCTOR__ORCHESTRATOR__MAX_CONCURRENT_AGENTS=3`）。
//! 每个段都能转换成对应模块使用的运行时参数。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::orchestrator::{OrchestratorConfig, RateLimitScope};
use crate::llm::{GatewayConfig, RateLimitConfig, RetryConfig};
use crate::react::loop_::LoopSettings;
use crate::tools::ToolExecutor;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub backend: BackendSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub orchestrator: OrchestratorSection,
    pub rate_limit: RateLimitSection,
}

/// [app] 段：日志级别、结果目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub log_level: String,
    /// 设置后每个 Agent 结束时写一份 JSON 记录
    pub results_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            results_dir: None,
        }
    }
}

/// [backend] 段：模型网关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub stream: bool,
    pub health_check: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11436".to_string(),
            model: "groq-gemma2-9b-it".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            request_timeout_secs: 45,
            stream: false,
            health_check: true,
        }
    }
}

impl BackendSection {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// [agent] 段：循环上限、完成判定阈值、失败与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub soft_iteration_threshold: usize,
    pub idle_tool_window: usize,
    pub nudge_iterations: usize,
    pub max_consecutive_failures: usize,
    pub transient_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_rate_limit_retries: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            soft_iteration_threshold: 10,
            idle_tool_window: 3,
            nudge_iterations: 3,
            max_consecutive_failures: 3,
            transient_retries: 2,
            retry_base_ms: 1000,
            retry_max_ms: 8000,
            max_rate_limit_retries: 5,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    /// 单次工具输出写入对话的字符上限
    pub max_output_chars: usize,
    /// 注册表级禁用的工具名
    pub disabled: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_output_chars: 8000,
            disabled: Vec::new(),
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_concurrent_agents: usize,
    pub eviction_high_water: usize,
    pub eviction_low_water: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let d = OrchestratorConfig::default();
        Self {
            max_concurrent_agents: d.max_concurrent_agents,
            eviction_high_water: d.eviction_high_water,
            eviction_low_water: d.eviction_low_water,
        }
    }
}

/// [rate_limit] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub min_interval_ms: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub scope: RateLimitScope,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            min_interval_ms: 2000,
            base_backoff_secs: 5,
            max_backoff_secs: 300,
            scope: RateLimitScope::Shared,
        }
    }
}

impl AppConfig {
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_iterations: self.agent.max_iterations.max(1),
            nudge_iterations: self.agent.nudge_iterations,
            max_consecutive_failures: self.agent.max_consecutive_failures.max(1),
            temperature: self.backend.temperature,
            max_tokens: self.backend.max_tokens,
            stream: self.backend.stream,
            health_check: self.backend.health_check,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            transient_retries: self.agent.transient_retries,
            base_delay: Duration::from_millis(self.agent.retry_base_ms),
            max_delay: Duration::from_millis(self.agent.retry_max_ms.max(self.agent.retry_base_ms)),
            max_rate_limit_retries: self.agent.max_rate_limit_retries,
            request_timeout: Duration::from_secs(self.backend.request_timeout_secs),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let base = Duration::from_secs(self.rate_limit.base_backoff_secs);
        RateLimitConfig {
            min_interval: Duration::from_millis(self.rate_limit.min_interval_ms),
            base_backoff: base,
            max_backoff: Duration::from_secs(self.rate_limit.max_backoff_secs).max(base),
        }
    }

    /// 低水位不高于高水位
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            max_concurrent_agents: o.max_concurrent_agents,
            eviction_high_water: o.eviction_high_water,
            eviction_low_water: o.eviction_low_water.min(o.eviction_high_water),
        }
    }

    pub fn tool_executor(&self) -> ToolExecutor {
        ToolExecutor::new(self.tools.tool_timeout_secs, self.tools.max_output_chars)
    }
}

/// 加载配置：default.toml（可选）-> 指定文件（可选）-> 环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("tools.disabled")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.loop_settings(), LoopSettings::default());
        assert_eq!(cfg.retry_config(), RetryConfig::default());
        assert_eq!(cfg.rate_limit_config(), RateLimitConfig::default());
        assert_eq!(cfg.orchestrator_config(), OrchestratorConfig::default());
        assert_eq!(cfg.backend.gateway_config(), GatewayConfig::default());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[app]
results_dir = "out"

[agent]
max_iterations = 20

[orchestrator]
max_concurrent_agents = 3
eviction_low_water = 500

[rate_limit]
scope = "per_agent"

[tools]
disabled = ["web_search"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.agent.nudge_iterations, 3);
        assert_eq!(cfg.orchestrator_config().max_concurrent_agents, 3);
        assert_eq!(cfg.orchestrator_config().eviction_low_water, 100);
        assert_eq!(cfg.rate_limit.scope, RateLimitScope::PerAgent);
        assert_eq!(cfg.tools.disabled, vec!["web_search".to_string()]);
        assert_eq!(cfg.app.results_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/conductor.toml"))).is_err());
    }
}
