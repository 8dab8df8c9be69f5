//! 认知层：对话主循环、完成判定、prompt 构造与过程事件

pub mod completion;
pub mod events;
pub mod loop_;
pub mod planner;

pub use completion::{
    CompletionContext, CompletionDetector, CompletionReason, PhraseCompletionDetector,
};
pub use events::AgentEvent;
pub use loop_::{run, LoopSettings};
