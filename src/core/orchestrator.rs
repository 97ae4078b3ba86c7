//! Agent 编排器：turn 的异步入口
//!
//! 每次 `run_turn` 在后台任务中执行一个 turn，事件经无界 channel 按产生顺序推给调用方。
//! 同一会话的 turn 由 [`SessionSupervisor`] 串行化；不同会话并发执行，共享 LLM、工具执行器与会话存储。

use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{AgentError, SessionSupervisor};
use crate::llm::LlmClient;
use crate::memory::SessionStore;
use crate::react::{run_turn, CorrelationIds, TurnDeps, TurnEvent, TurnOutcome};
use crate::tools::ToolExecutor;

/// 一个 turn 的事件流；发送端在 turn 结束时关闭
pub struct TurnStream {
    events: mpsc::UnboundedReceiver<TurnEvent>,
    handle: JoinHandle<Result<TurnOutcome, AgentError>>,
}

impl TurnStream {
    /// 下一个事件；turn 结束后返回 None
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// 收完全部事件
    pub async fn collect(mut self) -> (Vec<TurnEvent>, Option<TurnOutcome>) {
        let mut out = Vec::new();
        while let Some(e) = self.events.recv().await {
            out.push(e);
        }
        let outcome = match self.handle.await {
            Ok(Ok(o)) => Some(o),
            Ok(Err(_)) => None,
            Err(e) => {
                tracing::error!("turn task panicked: {}", e);
                None
            }
        };
        (out, outcome)
    }

    /// 作为 `Stream` 消费（传输层逐条转发）
    pub fn into_stream(self) -> impl Stream<Item = TurnEvent> {
        stream::unfold(self.events, |mut rx| async move {
            rx.recv().await.map(|e| (e, rx))
        })
    }
}

/// 编排器：可 Clone，内部组件均为 Arc 共享
#[derive(Clone)]
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    store: Arc<SessionStore>,
    supervisor: Arc<SessionSupervisor>,
    system_prompt: Option<Arc<str>>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            llm,
            executor,
            store,
            supervisor: Arc::new(SessionSupervisor::new()),
            system_prompt: None,
        }
    }

    /// 新会话首个 turn 写入的 system 消息
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = if prompt.trim().is_empty() {
            None
        } else {
            Some(Arc::from(prompt))
        };
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// 启动一个 turn，立即返回事件流
    pub fn run_turn(
        &self,
        session_id: impl Into<String>,
        user_text: impl Into<String>,
        ids: Option<CorrelationIds>,
    ) -> TurnStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let session_id = session_id.into();
        let user_text = user_text.into();
        let handle = tokio::spawn(async move {
            let _guard = this.supervisor.lock_turn(&session_id).await;
            let deps = TurnDeps {
                llm: this.llm.as_ref(),
                executor: this.executor.as_ref(),
                store: this.store.as_ref(),
                system_prompt: this.system_prompt.as_deref(),
            };
            run_turn(&deps, &session_id, &user_text, ids.unwrap_or_default(), &tx).await
        });
        TurnStream { events: rx, handle }
    }

    /// 结束会话：等待进行中的 turn，写快照后从内存移除
    pub async fn end_session(&self, session_id: &str) -> Result<(), AgentError> {
        let guard = self.supervisor.lock_turn(session_id).await;
        self.store.evict(session_id).await?;
        drop(guard);
        self.supervisor.remove(session_id);
        tracing::info!(session_id, "session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BackendMessage, ChatReply, MockLlmClient};
    use crate::memory::{RawArguments, ToolCall};
    use crate::react::{EventStatus, Stage};
    use crate::tools::{ToolRegistry, ToolSchema};
    use futures_util::StreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn orchestrator(llm: MockLlmClient, dir: &TempDir) -> Orchestrator {
        let mut reg = ToolRegistry::new();
        reg.register_fn(
            ToolSchema::new("ping", "Ping", json!({"type": "object", "properties": {}, "required": []})),
            |_, _| async { Ok(json!({"pong": true})) },
        )
        .unwrap();
        let executor = Arc::new(ToolExecutor::new(Arc::new(reg), 5));
        let store = Arc::new(SessionStore::new(10).with_history_dir(dir.path()));
        Orchestrator::new(Arc::new(llm), executor, store).with_system_prompt("be brief")
    }

    #[tokio::test]
    async fn test_stream_closes_after_turn() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(MockLlmClient::new(), &dir);
        let events: Vec<_> = orch.run_turn("s1", "hi", None).into_stream().collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::InitialResponse);
        assert_eq!(last.status, EventStatus::Success);
        assert_eq!(last.response.as_deref(), Some("Echo from Mock: hi"));
    }

    #[tokio::test]
    async fn test_turns_in_same_session_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let call = ToolCall::new("c1", "ping", RawArguments::Text("{}".into()));
        let llm = MockLlmClient::scripted(vec![
            Ok(ChatReply::new(BackendMessage::with_tool_calls(vec![call.clone()]))),
            Ok(ChatReply::new(BackendMessage::text("first done"))),
            Ok(ChatReply::new(BackendMessage::with_tool_calls(vec![call]))),
            Ok(ChatReply::new(BackendMessage::text("second done"))),
        ]);
        let orch = orchestrator(llm, &dir);
        let a = orch.run_turn("s1", "one", None);
        let b = orch.run_turn("s1", "two", None);
        let (ea, oa) = a.collect().await;
        let (eb, ob) = b.collect().await;
        assert!(oa.is_some() && ob.is_some());

        let max_a = ea.iter().map(|e| e.sequence()).max().unwrap();
        let min_b = eb.iter().map(|e| e.sequence()).min().unwrap();
        assert!(max_a < min_b, "second turn must start after the first");

        let history = orch.store().get_recent_messages("s1", None).await;
        let texts: Vec<_> = history.iter().filter_map(|m| m.content.clone()).collect();
        assert!(texts.iter().position(|t| t == "first done") < texts.iter().position(|t| t == "two"));
    }

    #[tokio::test]
    async fn test_end_session_persists_and_evicts() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(MockLlmClient::new(), &dir);
        orch.run_turn("s9", "remember me", None).collect().await;
        assert_eq!(orch.store().active_count().await, 1);
        orch.end_session("s9").await.unwrap();
        assert_eq!(orch.store().active_count().await, 0);

        let restored = orch.store().get_recent_messages("s9", None).await;
        assert!(restored.iter().any(|m| m.content.as_deref() == Some("remember me")));
    }

    #[tokio::test]
    async fn test_torn_history_line_keeps_earlier_turns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s5.jsonl");
        {
            let orch = orchestrator(MockLlmClient::new(), &dir);
            orch.run_turn("s5", "first question", None).collect().await;
            orch.end_session("s5").await.unwrap();
        }
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str(r#"{"role":"assistant","cont"#);
        std::fs::write(&path, raw).unwrap();

        let orch = orchestrator(MockLlmClient::new(), &dir);
        let (events, outcome) = orch.run_turn("s5", "second question", None).collect().await;
        assert!(outcome.is_some());
        assert!(events.iter().all(|e| e.status != EventStatus::Error));

        let history = orch.store().get_recent_messages("s5", None).await;
        let texts: Vec<_> = history.iter().filter_map(|m| m.content.clone()).collect();
        assert_eq!(texts.iter().filter(|t| *t == "be brief").count(), 1);
        assert!(texts.contains(&"first question".to_string()));
        assert!(texts.contains(&"second question".to_string()));

        let on_disk = crate::memory::SessionFile::new(&path).load().await.unwrap();
        assert!(on_disk.iter().any(|m| m.content.as_deref() == Some("first question")));
        assert!(on_disk.iter().any(|m| m.content.as_deref() == Some("second question")));
    }
}
