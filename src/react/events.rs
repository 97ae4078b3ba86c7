//! Turn 生命周期事件：序列化为扁平 JSON 记录供传输层转发
//!
//! 每个事件带完整关联字段（message_id、parent_id、conversation_id、user_input_id、sequence、timestamp、session_id），
//! 多会话交错时消费方可据此还原因果顺序。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::memory::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Error,
    Warning,
    Info,
}

/// 事件所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    InitialCall,
    InitialResponse,
    ToolCall,
    ToolArgs,
    ToolMissing,
    ToolExec,
    ToolResult,
    FinalResponse,
}

/// 关联字段
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub message_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub user_input_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

impl Correlation {
    /// 描述已写入消息的事件沿用该消息的 id 与 sequence
    pub fn for_message(message: &Message, user_input_id: Uuid, session_id: &str) -> Self {
        Self {
            message_id: message.message_id,
            parent_id: message.parent_id,
            conversation_id: message.conversation_id,
            user_input_id,
            sequence: message.sequence,
            timestamp: message.timestamp,
            session_id: session_id.to_string(),
        }
    }
}

/// 单个 turn 事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnEvent {
    pub status: EventStatus,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl TurnEvent {
    pub fn new(status: EventStatus, stage: Stage, correlation: Correlation) -> Self {
        Self {
            status,
            stage,
            tool: None,
            arguments: None,
            response: None,
            error: None,
            correlation,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn sequence(&self) -> u64 {
        self.correlation.sequence
    }

    pub fn is_error(&self) -> bool {
        self.status == EventStatus::Error
    }

    /// 一行 JSON（传输层输出格式）
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","stage":"final_response","error":"unserializable event: {e}"}}"#)
        })
    }
}
