//! 对话数据模型：Message / Role / ToolCall
//!
//! 每条消息带有因果链字段（message_id、parent_id、conversation_id）与会话内单调递增的 sequence，
//! 供传输层在多会话交错时重建顺序。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 消息角色（与 Chat Completions API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 后端给出的原始参数：序列化字符串或已结构化的对象
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawArguments {
    Text(String),
    Structured(Value),
}

impl RawArguments {
    /// 用于事件与指纹的 JSON 形式（字符串保持为字符串）
    pub fn to_value(&self) -> Value {
        match self {
            RawArguments::Text(s) => Value::String(s.clone()),
            RawArguments::Structured(v) => v.clone(),
        }
    }

    /// 发给 OpenAI 兼容端点时 arguments 必须是字符串
    pub fn to_wire_string(&self) -> String {
        match self {
            RawArguments::Text(s) => s.clone(),
            RawArguments::Structured(v) => v.to_string(),
        }
    }
}

/// 后端回复中的单个工具调用；重试会以新的 id 出现
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub raw_arguments: RawArguments,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        function_name: impl Into<String>,
        raw_arguments: RawArguments,
    ) -> Self {
        Self {
            id: id.into(),
            function_name: function_name.into(),
            raw_arguments,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            message_id: Uuid::new_v4(),
            parent_id: None,
            conversation_id: Uuid::nil(),
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn assistant(content: Option<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// 携带工具调用请求的 assistant 消息
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// 工具结果（或错误）消息
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        msg
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = Message::tool("call_1", "place_order", "{}").with_sequence(3);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
        assert_eq!(v["sequence"], 3);
        assert!(v.get("tool_calls").is_none());
    }

    #[test]
    fn test_raw_arguments_untagged() {
        let text: RawArguments = serde_json::from_str(r#""{\"a\":1}""#).unwrap();
        assert_eq!(text, RawArguments::Text("{\"a\":1}".into()));
        let obj: RawArguments = serde_json::from_str(r#"{"a":1}"#).unwrap();
        assert!(matches!(obj, RawArguments::Structured(_)));
        assert_eq!(obj.to_wire_string(), r#"{"a":1}"#);
    }

    #[test]
    fn test_null_content_round_trips() {
        let msg = Message::assistant(None);
        let line = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back.content, None);
        assert_eq!(back, msg);
    }
}
