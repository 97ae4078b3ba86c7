//! 核心编排层：错误类型、会话监管、turn 编排器

pub mod error;
pub mod orchestrator;
pub mod session_supervisor;

pub use error::{AgentError, IndexError, RegistryError, StoreError, ToolError, ToolErrorKind};
pub use orchestrator::{Orchestrator, TurnStream};
pub use session_supervisor::SessionSupervisor;
