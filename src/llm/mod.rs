//! LLM 层：后端抽象与实现（HTTP 网关 / Mock / 脚本化测试桩），以及限流与重试

pub mod gateway;
pub mod mock;
pub mod rate_limit;
pub mod retry;
pub mod traits;

pub use gateway::{GatewayBackend, GatewayConfig};
pub use mock::{MockBackend, ScriptedBackend};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{RetryConfig, RetryingBackend};
pub use traits::{ChatRequest, LlmError, ModelBackend, TextStream};
