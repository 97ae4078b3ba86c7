//! 错误类型
//!
//! 按层划分：编排层 AgentError（只影响当前 turn）、工具层 ToolError（只影响单次工具调用）、
//! 注册表 RegistryError、会话存储 StoreError、索引 IndexError。

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::llm::LlmError;

/// 编排层错误：生成后端不可用或返回空回复，turn 中止但会话保持一致
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] LlmError),

    #[error("Empty backend reply")]
    EmptyBackendReply,

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 工具调用失败的种类；编排器据此选择事件 stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// 字符串参数无法解析为 JSON 对象
    MalformedArguments,
    /// 注册表中没有该工具
    UnknownTool,
    /// 参数与 schema 不匹配（缺必填字段、类型不符）
    ArgumentMismatch,
    /// 工具执行期失败
    Runtime,
    /// 超过工具超时
    Timeout,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::MalformedArguments => "malformed arguments",
            ToolErrorKind::UnknownTool => "unknown tool",
            ToolErrorKind::ArgumentMismatch => "argument mismatch",
            ToolErrorKind::Runtime => "runtime failure",
            ToolErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// 工具错误：作为返回值而非异常，编排器按 kind 匹配
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::MalformedArguments, message)
    }

    pub fn unknown(name: &str) -> Self {
        Self::new(
            ToolErrorKind::UnknownTool,
            format!("Function '{name}' is not implemented."),
        )
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ArgumentMismatch, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Runtime, message)
    }
}

/// 注册表错误：重名或 schema 不完整
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    Duplicate(String),

    #[error("Invalid tool schema for '{name}': {}", .errors.join("; "))]
    InvalidSchema { name: String, errors: Vec<String> },
}

/// 会话存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// 序号必须严格递增
    #[error("Sequence {got} is not greater than last sequence {last} in session {session_id}")]
    SequenceViolation {
        session_id: String,
        last: u64,
        got: u64,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// 只能含 ASCII 字母数字、`-`、`_`，长度 1..=128
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// 持久化记录无法恢复；在 load / clear 成功前拒绝写入，磁盘文件保持原样
    #[error("History of session {0} could not be restored")]
    RestoreFailed(String),
}

/// 索引构建 / 查询错误（构建失败由 IndexCacheManager 降级为空检索器）
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Parse error in {path}: {reason}")]
    Parse { path: String, reason: String },
}
