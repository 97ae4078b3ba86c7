//! 工具层：Tool trait 与注册表、schema 校验、带超时的执行器、内置工具

pub mod executor;
pub mod place_order;
pub mod query_documents;
pub mod query_memory;
pub mod registry;
pub mod schema;

pub use executor::ToolExecutor;
pub use place_order::PlaceOrderTool;
pub use query_documents::QueryDocumentsTool;
pub use query_memory::QueryMemoryTool;
pub use registry::{FnTool, Tool, ToolContext, ToolRegistry};
pub use schema::{parameters_for, ToolSchema};
