//! 生成后端抽象
//!
//! 所有后端（OpenAI 兼容 / Ollama / Mock）实现 LlmClient：给定完整历史与可选工具 schema，
//! 返回一条回复（文本、工具调用或两者皆有）。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{Message, ToolCall};
use crate::tools::ToolSchema;

/// 后端调用失败；编排器据此产出 initial_call / final_response 错误事件
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode backend reply: {0}")]
    Decode(String),
}

/// 后端回复中的消息部分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMessage {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl BackendMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    /// 内容非空（去掉空白后）
    pub fn has_content(&self) -> bool {
        self.content
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }
}

/// 一次生成调用的结果；message 为 None 表示后端回复缺少消息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub message: Option<BackendMessage>,
}

impl ChatReply {
    pub fn new(message: BackendMessage) -> Self {
        Self {
            message: Some(message),
        }
    }

    pub fn empty() -> Self {
        Self { message: None }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.message
            .as_ref()
            .map(|m| !m.tool_calls.is_empty())
            .unwrap_or(false)
    }
}

/// 生成后端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// `tools` 为 None 时后端不会发起工具调用（用于 finalize 阶段）
    async fn chat(
        &self,
        history: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatReply, LlmError>;

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
