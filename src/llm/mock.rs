//! Mock 生成后端（用于测试与离线运行，无需 API）
//!
//! 按脚本依次返回预置回复；脚本用完后回显最后一条 user 消息。
//! 每次调用的历史与是否携带工具都会记录下来，供测试断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{BackendMessage, ChatReply, LlmClient, LlmError};
use crate::memory::{Message, Role};
use crate::tools::ToolSchema;

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub history: Vec<Message>,
    pub tool_names: Option<Vec<String>>,
}

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<ChatReply, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以预置回复序列构造
    pub fn scripted(replies: impl IntoIterator<Item = Result<ChatReply, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: Result<ChatReply, LlmError>) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(reply);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        history: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatReply, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                history: history.to_vec(),
                tool_names: tools.map(|t| t.iter().map(|s| s.name.clone()).collect()),
            });
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(reply) => reply,
            None => {
                let last_user = history
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content_str())
                    .unwrap_or("(no input)");
                Ok(ChatReply::new(BackendMessage::text(format!(
                    "Echo from Mock: {last_user}"
                ))))
            }
        }
    }
}
