//! 工具层：文本内嵌协议（扫描、检测、解析）、工具注册表、执行器与内置工具

pub mod creator;
pub mod echo;
pub mod executor;
pub mod markup;
pub mod protocol;
pub mod registry;

pub use creator::{AgentCreatorTool, AGENT_CREATOR, CURRENT_AGENT};
pub use echo::EchoTool;
pub use executor::{truncate_output, ToolExecutor, ToolOutcome, ToolUsage};
pub use protocol::{Command, Detection, ParamForm};
pub use registry::{Tool, ToolError, ToolRegistry, ToolSet};
