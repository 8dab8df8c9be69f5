//! Agent 定义：名称、描述、任务类型、指令或参数
//!
//! 未给出指令时按任务类型与参数合成（web_search / data_analysis / content_creation / calculation，
//! 其余类型逐项列出参数）。缺名称或既无指令又无参数视为创建错误。

use std::collections::BTreeMap;

use crate::core::error::CreationError;
use crate::core::state::AgentId;

/// 创建 Agent 所需的描述
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub description: Option<String>,
    pub task_type: Option<String>,
    pub instructions: Option<String>,
    pub parameters: BTreeMap<String, String>,
    /// 允许使用的工具名；None 表示全部普通工具
    pub tools: Option<Vec<String>>,
    pub parent: Option<AgentId>,
}

/// 校验并补全后的定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSpec {
    pub name: String,
    pub description: String,
    pub task_type: Option<String>,
    pub instructions: String,
    pub parameters: BTreeMap<String, String>,
    pub tools: Option<Vec<String>>,
    pub parent: Option<AgentId>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, d: impl Into<String>) -> Self {
        self.description = Some(d.into());
        self
    }

    pub fn with_task_type(mut self, t: impl Into<String>) -> Self {
        self.task_type = Some(t.into());
        self
    }

    pub fn with_instructions(mut self, i: impl Into<String>) -> Self {
        self.instructions = Some(i.into());
        self
    }

    pub fn with_param(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.parameters.insert(k.into(), v.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parent(mut self, parent: AgentId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// 校验并补全描述与指令
    pub fn resolve(self) -> Result<ResolvedSpec, CreationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(CreationError::MissingName);
        }
        let task_type = self
            .task_type
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty());
        let instructions = match self.instructions.as_deref().map(str::trim) {
            Some(i) if !i.is_empty() => i.to_string(),
            _ => synthesize_instructions(task_type.as_deref(), &self.parameters)
                .ok_or_else(|| CreationError::MissingInstructions(name.clone()))?,
        };
        let description = match self.description.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => match &task_type {
                Some(t) => format!("Agent to perform {t} task"),
                None => format!("Agent {name}"),
            },
        };
        Ok(ResolvedSpec {
            name,
            description,
            task_type,
            instructions,
            parameters: self.parameters,
            tools: self.tools,
            parent: self.parent,
        })
    }
}

fn param<'a>(params: &'a BTreeMap<String, String>, key: &str, default: &'a str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or(default)
}

/// 由任务类型与参数合成指令；无参数时返回 None
pub fn synthesize_instructions(
    task_type: Option<&str>,
    params: &BTreeMap<String, String>,
) -> Option<String> {
    if params.is_empty() {
        return None;
    }
    let text = match task_type {
        Some("web_search") => format!(
            "Your task is to perform comprehensive web search and analysis.\n\n\
             Search Query: \"{}\"\n\n\
             Please perform the following steps:\n\
             1. Search for general information about the query\n\
             2. If it's a domain/website, search for security-related information\n\
             3. Look for any technical details or background information\n\
             4. Compile a comprehensive report with your findings\n\n\
             Use the web search tool multiple times with different search terms to gather complete information.",
            param(params, "query", "")
        ),
        Some("data_analysis") => format!(
            "Your task is to perform data analysis.\n\n\
             Data: {}\nAnalysis Type: {}\n\n\
             Please analyze the provided data systematically:\n\
             1. Understand the data structure and content\n\
             2. Look for patterns, trends, and anomalies\n\
             3. Provide statistical insights where relevant\n\
             4. Present findings in a clear, actionable format",
            param(params, "data", ""),
            param(params, "analysis_type", "general")
        ),
        Some("content_creation") => format!(
            "Your task is to create content.\n\n\
             Topic: {}\nContent Type: {}\n\n\
             Please create comprehensive content:\n\
             1. Research the topic\n\
             2. Gather current information and multiple perspectives\n\
             3. Structure the content appropriately\n\
             4. Include relevant details and examples\n\
             5. Ensure accuracy and completeness",
            param(params, "topic", ""),
            param(params, "content_type", "general")
        ),
        Some("calculation") => format!(
            "Your task is to perform a calculation.\n\n\
             Expression: {}\n\n\
             1. Break the problem down into steps\n\
             2. Show your work clearly\n\
             3. Verify the result when possible\n\
             4. Explain the methodology used",
            param(params, "expression", "")
        ),
        other => {
            let mut s = match other {
                Some(t) => format!("Your task is to perform a {t} operation.\n\nParameters:\n"),
                None => "Complete the assigned task using the following parameters:\n".to_string(),
            };
            for (k, v) in params {
                s.push_str(&format!("- {k}: {v}\n"));
            }
            s.push_str("\nUse the available tools as needed and report your findings.");
            s
        }
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_name() {
        let err = AgentSpec::new("  ").with_instructions("x").resolve().unwrap_err();
        assert_eq!(err, CreationError::MissingName);
    }

    #[test]
    fn test_missing_instructions_without_params() {
        let err = AgentSpec::new("a").with_task_type("web_search").resolve().unwrap_err();
        assert_eq!(err, CreationError::MissingInstructions("a".into()));
    }

    #[test]
    fn test_synthesized_web_search_instructions() {
        let r = AgentSpec::new("recon")
            .with_task_type("Web_Search")
            .with_param("query", "example.com")
            .resolve()
            .unwrap();
        assert!(r.instructions.contains("Search Query: \"example.com\""));
        assert_eq!(r.description, "Agent to perform web_search task");
    }

    #[test]
    fn test_generic_synthesis_lists_params() {
        let r = AgentSpec::new("g")
            .with_param("target", "x")
            .with_param("depth", "2")
            .resolve()
            .unwrap();
        assert!(r.instructions.contains("- depth: 2"));
        assert!(r.instructions.contains("- target: x"));
    }

    #[test]
    fn test_explicit_instructions_win() {
        let r = AgentSpec::new("a")
            .with_task_type("calculation")
            .with_param("expression", "1+1")
            .with_instructions("just do it")
            .resolve()
            .unwrap();
        assert_eq!(r.instructions, "just do it");
    }
}
