//! 错误恢复引擎
//!
//! 根据 AgentError 的可修复性与连续失败次数返回 RecoveryAction，供对话循环决定注入诊断还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 把错误映射为动作：可修复错误注入 User 诊断，连续失败达到上限或不可修复时终止
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_consecutive_failures: usize,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RecoveryEngine {
    pub fn new(max_consecutive_failures: usize) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    /// consecutive 为包含本次在内的连续失败次数
    pub fn handle(&self, err: &AgentError, consecutive: usize) -> RecoveryAction {
        if !err.is_fixable() {
            return RecoveryAction::Abort(err.to_string());
        }
        if consecutive >= self.max_consecutive_failures {
            return RecoveryAction::Abort(format!(
                "Aborted after {consecutive} consecutive failures. Last error: {err}"
            ));
        }
        let prompt = match err {
            AgentError::Llm(e) => format!(
                "Error occurred: {e}. Please continue with available information."
            ),
            AgentError::ToolExecutionFailed { tool, reason } => format!(
                "Tool '{tool}' encountered an error: {reason}\nPlease continue with available information."
            ),
            AgentError::InvalidToolRequest { diagnostic, .. } => diagnostic.clone(),
            other => format!("Error occurred: {other}. Please continue with available information."),
        };
        RecoveryAction::Diagnose(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_transient_backend_error_is_diagnosed() {
        let engine = RecoveryEngine::default();
        let err = AgentError::Llm(LlmError::EmptyResponse);
        match engine.handle(&err, 1) {
            RecoveryAction::Diagnose(msg) => {
                assert!(msg.starts_with("Error occurred:"));
                assert!(msg.contains("Please continue with available information."));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_third_consecutive_failure_aborts() {
        let engine = RecoveryEngine::default();
        let err = AgentError::ToolExecutionFailed {
            tool: "web_search".into(),
            reason: "timeout".into(),
        };
        assert!(matches!(engine.handle(&err, 2), RecoveryAction::Diagnose(_)));
        match engine.handle(&err, 3) {
            RecoveryAction::Abort(reason) => assert!(reason.contains("3 consecutive failures")),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_rejection_aborts_verbatim() {
        let engine = RecoveryEngine::default();
        let err = AgentError::Llm(LlmError::Rejected("status 400: context too long".into()));
        assert_eq!(
            engine.handle(&err, 1),
            RecoveryAction::Abort(
                "LLM error: backend rejected the request: status 400: context too long".into()
            )
        );
    }

    #[test]
    fn test_invalid_request_uses_diagnostic() {
        let engine = RecoveryEngine::default();
        let err = AgentError::InvalidToolRequest {
            tool: "web_search".into(),
            diagnostic: "missing 'query'".into(),
        };
        assert_eq!(
            engine.handle(&err, 1),
            RecoveryAction::Diagnose("missing 'query'".into())
        );
    }
}
