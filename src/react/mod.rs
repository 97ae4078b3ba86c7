//! 认知层：单个 turn 的 tool-call 主循环、参数解析、生命周期事件

pub mod arguments;
pub mod events;
pub mod loop_;

pub use arguments::resolve_arguments;
pub use events::{Correlation, EventStatus, Stage, TurnEvent};
pub use loop_::{run_turn, CorrelationIds, TurnDeps, TurnOutcome};
