//! OpenAI 兼容 Chat Completions 客户端
//!
//! 直接以 JSON 调用 `<base_url>/chat/completions`，可接 OpenAI、Ollama（`/v1` 兼容端点）、自建代理等。
//! 工具调用参数原样保留：字符串保持为字符串，对象保持为对象，由编排器统一解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{BackendMessage, ChatReply, LlmClient, LlmError};
use crate::memory::{Message, RawArguments, Role, ToolCall};
use crate::tools::ToolSchema;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端
///
/// 直接用 reqwest 收发 JSON 而非 async-openai 的类型化请求：Ollama 等兼容服务返回的
/// tool_calls.arguments 可能是字符串也可能是对象，类型化响应只接受字符串。
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为 None 时读取 `OPENAI_API_KEY`；仍为空则不带 Authorization 头（Ollama）
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty());
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key,
            usage: TokenUsage::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, history: &[Message], tools: Option<&[ToolSchema]>) -> Value {
        let messages: Vec<Value> = history.iter().map(to_wire_message).collect();
        let mut request = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            let wire: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            request["tools"] = Value::Array(wire);
            request["tool_choice"] = json!("auto");
        }
        request
    }
}

fn to_wire_message(m: &Message) -> Value {
    let mut msg = json!({
        "role": m.role.as_str(),
        "content": m.content,
    });
    if m.role == Role::Tool {
        if let Some(id) = &m.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        if let Some(name) = &m.name {
            msg["name"] = json!(name);
        }
    }
    if !m.tool_calls.is_empty() {
        msg["tool_calls"] = m
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.function_name,
                        "arguments": tc.raw_arguments.to_wire_string(),
                    }
                })
            })
            .collect();
    }
    msg
}

/// 解析回复：无 choices / 无 message 时返回 `ChatReply { message: None }`
pub(crate) fn parse_reply(response: &Value) -> ChatReply {
    let Some(message) = response["choices"]
        .as_array()
        .and_then(|c| c.first())
        .map(|c| &c["message"])
        .filter(|m| m.is_object())
    else {
        return ChatReply::empty();
    };

    let content = message["content"].as_str().map(String::from);
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| {
                    let name = call["function"]["name"].as_str()?;
                    let id = call["id"]
                        .as_str()
                        .map(String::from)
                        .unwrap_or_else(|| format!("call_{idx}"));
                    let raw = match &call["function"]["arguments"] {
                        Value::String(s) => RawArguments::Text(s.clone()),
                        Value::Null => RawArguments::Structured(json!({})),
                        other => RawArguments::Structured(other.clone()),
                    };
                    Some(ToolCall::new(id, name, raw))
                })
                .collect()
        })
        .unwrap_or_default();

    ChatReply::new(BackendMessage {
        content,
        tool_calls,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(
        &self,
        history: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatReply, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(history, tools);

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        if let Some(usage) = value["usage"].as_object() {
            self.usage.add(
                usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            );
        }

        let reply = parse_reply(&value);
        tracing::debug!(
            model = %self.model,
            tool_calls = reply.message.as_ref().map(|m| m.tool_calls.len()).unwrap_or(0),
            "chat completion received"
        );
        Ok(reply)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_call_with_string_arguments() {
        let resp = json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "place_order", "arguments": "{\"size\":\"Large\"}"}
                }]
            }}]
        });
        let reply = parse_reply(&resp);
        assert!(reply.has_tool_calls());
        let msg = reply.message.unwrap();
        assert_eq!(msg.content, None);
        assert_eq!(msg.tool_calls[0].function_name, "place_order");
        assert_eq!(
            msg.tool_calls[0].raw_arguments,
            RawArguments::Text("{\"size\":\"Large\"}".into())
        );
    }

    #[test]
    fn test_parse_structured_arguments_and_missing_id() {
        let resp = json!({
            "choices": [{"message": {
                "content": "",
                "tool_calls": [{"function": {"name": "query_documents", "arguments": {"query": "x"}}}]
            }}]
        });
        let msg = parse_reply(&resp).message.unwrap();
        assert_eq!(msg.tool_calls[0].id, "call_0");
        assert!(matches!(
            msg.tool_calls[0].raw_arguments,
            RawArguments::Structured(_)
        ));
    }

    #[test]
    fn test_parse_without_choices_is_empty() {
        assert_eq!(parse_reply(&json!({"choices": []})), ChatReply::empty());
        assert_eq!(parse_reply(&json!({})), ChatReply::empty());
    }

    #[test]
    fn test_wire_message_for_tool_calls() {
        let msg = Message::assistant_tool_calls(
            None,
            vec![ToolCall::new(
                "c1",
                "place_order",
                RawArguments::Structured(json!({"a": 1})),
            )],
        );
        let wire = to_wire_message(&msg);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");

        let tool = to_wire_message(&Message::tool("c1", "place_order", "ok"));
        assert_eq!(tool["tool_call_id"], "c1");
    }
}
