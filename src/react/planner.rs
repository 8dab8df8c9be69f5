//! Prompt 构造：system prompt、任务消息与工具使用提示
//!
//! system prompt 列出 Agent 身份、任务参数、每个可用工具的名称与描述、标准调用格式与工作规则。

use std::sync::Arc;

use crate::core::definition::ResolvedSpec;
use crate::tools::Tool;

fn task_guidance(task_type: Option<&str>) -> &'static str {
    match task_type {
        Some("web_search") => {
            "For web search tasks:\n\
             1. Start with broad search terms, then refine as needed\n\
             2. Use multiple search queries to get comprehensive information\n\
             3. Analyze search results and extract key information\n\
             4. Summarize findings with sources"
        }
        Some("data_analysis") => {
            "For data analysis tasks:\n\
             1. First understand the data structure and content\n\
             2. Look for patterns, trends, and anomalies\n\
             3. Present findings in clear, actionable format"
        }
        Some("content_creation") => {
            "For content creation tasks:\n\
             1. Research the topic thoroughly\n\
             2. Structure content logically\n\
             3. Ensure accuracy and completeness"
        }
        Some("calculation") => {
            "For calculation tasks:\n\
             1. Break down complex problems into steps\n\
             2. Show your work clearly\n\
             3. Verify results when possible"
        }
        _ => "Complete the assigned task using available tools as needed.",
    }
}

/// 构造 system prompt
pub fn system_prompt(spec: &ResolvedSpec, tools: &[Arc<dyn Tool>]) -> String {
    let tools_text = if tools.is_empty() {
        "No tools available".to_string()
    } else {
        tools
            .iter()
            .map(|t| {
                let mut s = format!("=== {} ===\nDescription: {}\n", t.name(), t.describe());
                if !t.required_params().is_empty() {
                    s.push_str(&format!("Required parameters: {}\n", t.required_params().join(", ")));
                }
                if !t.optional_params().is_empty() {
                    s.push_str(&format!("Optional parameters: {}\n", t.optional_params().join(", ")));
                }
                s.push_str(&format!("Usage:\n{}\n", t.usage_example()));
                s
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let params = if spec.parameters.is_empty() {
        "(none)".to_string()
    } else {
        spec.parameters
            .iter()
            .map(|(k, v)| format!("  {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are {name}, a specialized AI agent.\n\n\
         AGENT DETAILS:\n\
         - Name: {name}\n\
         - Description: {description}\n\
         - Task Type: {task_type}\n\
         - Task Parameters:\n{params}\n\n\
         MISSION:\n\
         You must complete your assigned task step-by-step using the available tools.\n\n\
         AVAILABLE TOOLS:\n{tools_text}\n\
         TOOL CALL FORMAT:\n\
         <tool name=\"tool_name\">\n  <parameter_name>value</parameter_name>\n</tool>\n\
         Only one tool call is executed per reply; the first complete block wins.\n\n\
         TASK-SPECIFIC GUIDANCE:\n{guidance}\n\n\
         IMPORTANT RULES:\n\
         1. Use tools by including their exact tag format in your responses\n\
         2. Wait for tool results before proceeding to next steps\n\
         3. Provide clear summaries of your findings\n\
         4. When you are done, say \"task completed\" and give your final results",
        name = spec.name,
        description = spec.description,
        task_type = spec.task_type.as_deref().unwrap_or("general"),
        guidance = task_guidance(spec.task_type.as_deref()),
    )
}

/// 首条 User 消息：任务指令
pub fn task_message(spec: &ResolvedSpec) -> String {
    spec.instructions.clone()
}

/// 前几轮没有调用工具时的提示
pub fn encouragement(tool: &dyn Tool) -> String {
    format!(
        "You have tools available to help complete your task. \
         Please use them with their exact format, for example:\n\n{}\n\n\
         Start with general information, then refine based on what you find.",
        tool.usage_example()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::definition::AgentSpec;
    use crate::tools::EchoTool;

    #[test]
    fn test_system_prompt_lists_tools_and_params() {
        let spec = AgentSpec::new("recon")
            .with_task_type("web_search")
            .with_param("query", "example.com")
            .resolve()
            .unwrap();
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool::named("web_search"))];
        let prompt = system_prompt(&spec, &tools);
        assert!(prompt.contains("You are recon"));
        assert!(prompt.contains("=== web_search ==="));
        assert!(prompt.contains("query: example.com"));
        assert!(prompt.contains("<tool name=\"web_search\">"));
    }

    #[test]
    fn test_encouragement_has_example() {
        let msg = encouragement(&EchoTool::named("web_search"));
        assert!(msg.contains("<query>...</query>"));
    }
}
