//! 完成判定
//!
//! 回复中没有工具调用时才会询问判定器。默认实现 PhraseCompletionDetector 依次检查：
//! 强完成短语、两个以上不同的弱短语、软阈值之后的空闲（用过工具但最近几轮没再用）、硬迭代上限。
//! 这是启发式规则，不是正确性保证；需要时可换成自己的 CompletionDetector。

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 完成原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CompletionReason {
    StrongPhrase(String),
    WeakPhrases(Vec<String>),
    IdleAfterTools { iteration: usize },
    IterationCeiling { iterations: usize },
}

/// 判定所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct CompletionContext<'a> {
    pub reply: &'a str,
    pub iteration: usize,
    pub max_iterations: usize,
    /// 本次运行累计工具调用次数
    pub tool_calls: usize,
    pub last_tool_iteration: Option<usize>,
}

pub trait CompletionDetector: Send + Sync {
    fn check(&self, ctx: &CompletionContext<'_>) -> Option<CompletionReason>;
}

pub const STRONG_PHRASES: [&str; 7] = [
    "task completed",
    "task complete",
    "analysis complete",
    "report complete",
    "final results",
    "task finished",
    "no further action needed",
];

pub const WEAK_PHRASES: [&str; 6] = [
    "conclusion",
    "findings summary",
    "to summarize",
    "key findings",
    "recommendations",
    "next steps",
];

/// 基于短语与迭代计数的判定器
pub struct PhraseCompletionDetector {
    strong: Vec<(String, Regex)>,
    weak: Vec<(String, Regex)>,
    soft_threshold: usize,
    idle_window: usize,
}

fn compile(phrases: &[&str]) -> Vec<(String, Regex)> {
    phrases
        .iter()
        .filter_map(|p| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(p));
            Regex::new(&pattern).ok().map(|re| (p.to_string(), re))
        })
        .collect()
}

impl Default for PhraseCompletionDetector {
    fn default() -> Self {
        Self::new(10, 3)
    }
}

impl PhraseCompletionDetector {
    pub fn new(soft_threshold: usize, idle_window: usize) -> Self {
        Self {
            strong: compile(&STRONG_PHRASES),
            weak: compile(&WEAK_PHRASES),
            soft_threshold,
            idle_window: idle_window.max(1),
        }
    }

    pub fn with_strong_phrases(mut self, phrases: &[&str]) -> Self {
        self.strong = compile(phrases);
        self
    }

    pub fn with_weak_phrases(mut self, phrases: &[&str]) -> Self {
        self.weak = compile(phrases);
        self
    }
}

impl CompletionDetector for PhraseCompletionDetector {
    fn check(&self, ctx: &CompletionContext<'_>) -> Option<CompletionReason> {
        if let Some((phrase, _)) = self.strong.iter().find(|(_, re)| re.is_match(ctx.reply)) {
            return Some(CompletionReason::StrongPhrase(phrase.clone()));
        }

        let weak: Vec<String> = self
            .weak
            .iter()
            .filter(|(_, re)| re.is_match(ctx.reply))
            .map(|(p, _)| p.clone())
            .collect();
        if weak.len() >= 2 {
            return Some(CompletionReason::WeakPhrases(weak));
        }

        let idle = ctx
            .last_tool_iteration
            .map_or(false, |last| ctx.iteration.saturating_sub(last) >= self.idle_window);
        if ctx.iteration > self.soft_threshold && ctx.tool_calls > 0 && idle {
            return Some(CompletionReason::IdleAfterTools {
                iteration: ctx.iteration,
            });
        }

        if ctx.iteration >= ctx.max_iterations {
            return Some(CompletionReason::IterationCeiling {
                iterations: ctx.iteration,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(reply: &str, iteration: usize) -> CompletionContext<'_> {
        CompletionContext {
            reply,
            iteration,
            max_iterations: 15,
            tool_calls: 0,
            last_tool_iteration: None,
        }
    }

    #[test]
    fn test_strong_phrase_stops() {
        let d = PhraseCompletionDetector::default();
        assert_eq!(
            d.check(&ctx("All done. TASK COMPLETED.", 1)),
            Some(CompletionReason::StrongPhrase("task completed".into()))
        );
    }

    #[test]
    fn test_single_weak_phrase_is_not_enough() {
        let d = PhraseCompletionDetector::default();
        assert_eq!(d.check(&ctx("In conclusion, more work is needed.", 2)), None);
        assert!(matches!(
            d.check(&ctx("Conclusion: fine. Recommendations: patch.", 2)),
            Some(CompletionReason::WeakPhrases(p)) if p.len() == 2
        ));
    }

    #[test]
    fn test_word_boundaries() {
        let d = PhraseCompletionDetector::default();
        assert_eq!(d.check(&ctx("subtask completedness", 1)), None);
    }

    #[test]
    fn test_soft_rule_needs_prior_tool_use_and_idle_window() {
        let d = PhraseCompletionDetector::default();
        let mut c = ctx("still thinking", 11);
        assert_eq!(d.check(&c), None);
        c.tool_calls = 2;
        c.last_tool_iteration = Some(9);
        assert_eq!(d.check(&c), None);
        c.last_tool_iteration = Some(8);
        assert_eq!(
            d.check(&c),
            Some(CompletionReason::IdleAfterTools { iteration: 11 })
        );
    }

    #[test]
    fn test_hard_ceiling() {
        let d = PhraseCompletionDetector::default();
        assert_eq!(d.check(&ctx("hmm", 14)), None);
        assert_eq!(
            d.check(&ctx("hmm", 15)),
            Some(CompletionReason::IterationCeiling { iterations: 15 })
        );
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&CompletionReason::IterationCeiling { iterations: 3 }).unwrap();
        assert_eq!(json, r#"{"kind":"iteration_ceiling","detail":{"iterations":3}}"#);
    }
}
