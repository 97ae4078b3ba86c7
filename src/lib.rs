//! Hive - Rust 工具调用对话智能体编排器
//!
//! 模块划分：
//! - **agent**: 进程级 Agent 对象（一次构建、多会话共享）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、会话监管、turn 编排器
//! - **llm**: 生成后端抽象与实现（OpenAI 兼容 / Ollama / Mock）、嵌入
//! - **memory**: 对话模型、会话存储与持久化、检索索引缓存
//! - **observability**: 日志初始化
//! - **react**: 单个 turn 的 tool-call 主循环与生命周期事件
//! - **tools**: 工具注册表、schema 校验、执行器、内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::Agent;
pub use core::{Orchestrator, TurnStream};
pub use react::{CorrelationIds, TurnEvent};
