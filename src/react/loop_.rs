//! Tool-call 主循环（单个 turn）
//!
//! Bootstrap -> Ingest -> Generate -> (直接回复 | 工具分发 -> Finalize)。
//! 每一步通过 events 通道推送 TurnEvent；会话存储只在追加/读取历史时加锁，
//! 后端调用与工具执行期间不持锁。调用方负责保证同一会话同一时刻只跑一个 turn。

use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::core::{AgentError, StoreError, ToolErrorKind};
use crate::llm::LlmClient;
use crate::memory::{canonical_content, canonical_string, fingerprint, Message, SessionStore, ToolCall};
use crate::react::arguments::resolve_arguments;
use crate::react::{Correlation, EventStatus, Stage, TurnEvent};
use crate::tools::{ToolContext, ToolExecutor};

/// 调用方可提供的关联 id；缺省时 conversation_id 取会话自身的，user_input_id 新生成
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationIds {
    pub conversation_id: Option<Uuid>,
    pub user_input_id: Option<Uuid>,
}

/// turn 的正常结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// 首次生成即给出文本回复
    Replied(String),
    /// 工具分发后的最终回复
    Finalized(String),
    /// 最终回复 content 为 null，未写入
    NoFinalContent,
}

/// 一个 turn 所需的共享组件
pub struct TurnDeps<'a> {
    pub llm: &'a dyn LlmClient,
    pub executor: &'a ToolExecutor,
    pub store: &'a SessionStore,
    pub system_prompt: Option<&'a str>,
}

struct Turn<'a> {
    deps: &'a TurnDeps<'a>,
    events: &'a UnboundedSender<TurnEvent>,
    session_id: String,
    conversation_id: Uuid,
    user_input_id: Uuid,
    /// 因果链头：最近一次写入的消息
    head: Option<Uuid>,
}

impl<'a> Turn<'a> {
    fn emit(&self, event: TurnEvent) {
        // 消费方停止接收不影响 turn 继续执行
        let _ = self.events.send(event);
    }

    fn correlation_for(&self, message: &Message) -> Correlation {
        Correlation::for_message(message, self.user_input_id, &self.session_id)
    }

    /// 无对应消息的事件单独占用一个序号
    async fn fresh_correlation(&self) -> Correlation {
        Correlation {
            message_id: Uuid::new_v4(),
            parent_id: self.head,
            conversation_id: self.conversation_id,
            user_input_id: self.user_input_id,
            sequence: self.deps.store.next_sequence(&self.session_id).await,
            timestamp: chrono::Utc::now(),
            session_id: self.session_id.clone(),
        }
    }

    async fn emit_fresh(&self, status: EventStatus, stage: Stage, build: impl FnOnce(TurnEvent) -> TurnEvent) {
        let correlation = self.fresh_correlation().await;
        self.emit(build(TurnEvent::new(status, stage, correlation)));
    }

    async fn append(&mut self, message: Message) -> Result<Message, StoreError> {
        let sequence = self.deps.store.next_sequence(&self.session_id).await;
        let message = message
            .with_sequence(sequence)
            .with_parent(self.head)
            .with_conversation(self.conversation_id);
        let stored = self.deps.store.add_message(&self.session_id, message).await?;
        self.head = Some(stored.message_id);
        Ok(stored)
    }

    /// 追加失败时在给定阶段发出错误事件
    async fn append_or_report(&mut self, message: Message, stage: Stage) -> Result<Message, AgentError> {
        match self.append(message).await {
            Ok(m) => Ok(m),
            Err(e) => {
                tracing::error!(session_id = %self.session_id, "failed to append message: {}", e);
                let text = format!("Failed to record message: {e}");
                self.emit_fresh(EventStatus::Error, stage, |ev| ev.with_error(text)).await;
                Err(e.into())
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<(), AgentError> {
        let Some(prompt) = self.deps.system_prompt.filter(|p| !p.trim().is_empty()) else {
            return Ok(());
        };
        if !self.deps.store.is_new(&self.session_id).await {
            return Ok(());
        }
        let system = Message::system(prompt).with_conversation(self.conversation_id);
        let stored = self
            .deps
            .store
            .set_system_message(&self.session_id, system)
            .await?;
        self.head = Some(stored.message_id);
        tracing::debug!(session_id = %self.session_id, "system prompt installed");
        Ok(())
    }

    async fn run(&mut self, user_text: &str) -> Result<TurnOutcome, AgentError> {
        if let Err(e) = self.bootstrap().await {
            let text = e.to_string();
            self.emit_fresh(EventStatus::Error, Stage::InitialCall, |ev| ev.with_error(text)).await;
            return Err(e);
        }
        if self.head.is_none() {
            self.head = self.deps.store.last_message_id(&self.session_id).await;
        }

        let user = Message::user(user_text).with_message_id(self.user_input_id);
        self.append_or_report(user, Stage::InitialCall).await?;

        let schemas = self.deps.executor.schemas();
        let history = self.deps.store.get_recent_messages(&self.session_id, None).await;
        let reply = match self.deps.llm.chat(&history, Some(schemas.as_slice())).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "initial backend call failed: {}", e);
                let text = e.to_string();
                self.emit_fresh(EventStatus::Error, Stage::InitialCall, |ev| ev.with_error(text)).await;
                return Err(AgentError::BackendUnavailable(e));
            }
        };
        let Some(message) = reply.message else {
            self.emit_fresh(EventStatus::Error, Stage::InitialResponse, |ev| {
                ev.with_error("Backend returned no message")
            })
            .await;
            return Err(AgentError::EmptyBackendReply);
        };

        if message.tool_calls.is_empty() && message.has_content() {
            let content = message.content.unwrap_or_default();
            let stored = self
                .append_or_report(Message::assistant(Some(content.clone())), Stage::InitialResponse)
                .await?;
            let event = TurnEvent::new(EventStatus::Success, Stage::InitialResponse, self.correlation_for(&stored))
                .with_response(content.clone());
            self.emit(event);
            return Ok(TurnOutcome::Replied(content));
        }

        if !message.tool_calls.is_empty() {
            let carrier = Message::assistant_tool_calls(message.content.clone(), message.tool_calls.clone());
            self.append_or_report(carrier, Stage::ToolCall).await?;
            for call in &message.tool_calls {
                self.dispatch(call).await?;
            }
        }

        self.finalize().await
    }

    async fn dispatch(&mut self, call: &ToolCall) -> Result<(), AgentError> {
        let raw = call.raw_arguments.to_value();
        let name = call.function_name.clone();
        {
            let (name, raw) = (name.clone(), raw.clone());
            self.emit_fresh(EventStatus::Info, Stage::ToolCall, |ev| {
                ev.with_tool(name).with_arguments(raw)
            })
            .await;
        }

        let resolved = resolve_arguments(&call.raw_arguments);
        let key = match &resolved {
            Ok(args) => fingerprint(&name, args),
            Err(_) => fingerprint(&name, &raw),
        };
        let attempts = self.deps.store.record_fingerprint(&self.session_id, &key).await;
        if attempts > 1 {
            tracing::debug!(session_id = %self.session_id, tool = %name, attempts, "repeated tool call");
        }

        let ctx = ToolContext::new(self.session_id.clone());
        let result = match resolved {
            Ok(args) => self.deps.executor.dispatch(&name, args, &ctx).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                let content = canonical_content(&value);
                let stored = self
                    .append_or_report(Message::tool(&call.id, &name, content.clone()), Stage::ToolResult)
                    .await?;
                let event = TurnEvent::new(EventStatus::Success, Stage::ToolResult, self.correlation_for(&stored))
                    .with_tool(&name)
                    .with_response(content);
                self.emit(event);
            }
            Err(err) => {
                let stage = match err.kind {
                    ToolErrorKind::MalformedArguments => Stage::ToolArgs,
                    ToolErrorKind::UnknownTool => Stage::ToolMissing,
                    ToolErrorKind::ArgumentMismatch | ToolErrorKind::Runtime | ToolErrorKind::Timeout => {
                        Stage::ToolExec
                    }
                };
                tracing::warn!(session_id = %self.session_id, tool = %name, kind = %err.kind, "tool call failed: {}", err.message);
                let content = canonical_string(&json!({ "error": err.message }));
                let stored = self
                    .append_or_report(Message::tool(&call.id, &name, content), stage)
                    .await?;
                let event = TurnEvent::new(EventStatus::Error, stage, self.correlation_for(&stored))
                    .with_tool(&name)
                    .with_arguments(raw)
                    .with_error(err.message);
                self.emit(event);
            }
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<TurnOutcome, AgentError> {
        let history = self.deps.store.get_recent_messages(&self.session_id, None).await;
        let reply = match self.deps.llm.chat(&history, None).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "final backend call failed: {}", e);
                let text = e.to_string();
                self.emit_fresh(EventStatus::Error, Stage::FinalResponse, |ev| ev.with_error(text)).await;
                return Err(AgentError::BackendUnavailable(e));
            }
        };
        let Some(message) = reply.message else {
            self.emit_fresh(EventStatus::Error, Stage::FinalResponse, |ev| {
                ev.with_error("Backend returned no message")
            })
            .await;
            return Err(AgentError::EmptyBackendReply);
        };

        match message.content {
            None => {
                self.emit_fresh(EventStatus::Warning, Stage::FinalResponse, |ev| {
                    ev.with_error("Final response had no content")
                })
                .await;
                Ok(TurnOutcome::NoFinalContent)
            }
            Some(content) => {
                let stored = self
                    .append_or_report(Message::assistant(Some(content.clone())), Stage::FinalResponse)
                    .await?;
                let event = TurnEvent::new(EventStatus::Success, Stage::FinalResponse, self.correlation_for(&stored))
                    .with_response(content.clone());
                self.emit(event);
                Ok(TurnOutcome::Finalized(content))
            }
        }
    }
}

/// 执行一个 turn，事件推入 `events`；失败已作为错误事件推送，返回值供调用方记录
pub async fn run_turn(
    deps: &TurnDeps<'_>,
    session_id: &str,
    user_text: &str,
    ids: CorrelationIds,
    events: &UnboundedSender<TurnEvent>,
) -> Result<TurnOutcome, AgentError> {
    let conversation_id = match ids.conversation_id {
        Some(c) => c,
        None => deps.store.conversation_id(session_id).await,
    };
    let mut turn = Turn {
        deps,
        events,
        session_id: session_id.to_string(),
        conversation_id,
        user_input_id: ids.user_input_id.unwrap_or_else(Uuid::new_v4),
        head: None,
    };
    let outcome = turn.run(user_text).await;
    match &outcome {
        Ok(o) => tracing::info!(session_id, outcome = ?o, "turn completed"),
        Err(e) => tracing::warn!(session_id, "turn aborted: {}", e),
    }
    outcome
}
