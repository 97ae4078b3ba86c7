//! 历史记忆检索工具
//!
//! 共享模式下查 `memory` 分区（所有会话历史）；否则查 `memory:<session_id>`，只含调用方会话自己的记录。
//! 会话范围由 ToolContext 提供，不由模型决定。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::memory::{IndexCacheManager, PartitionId};
use crate::tools::{Tool, ToolContext};

pub const NO_MEMORY: &str = "No relevant conversation history found";

pub struct QueryMemoryTool {
    index: Arc<IndexCacheManager>,
    shared: bool,
}

impl QueryMemoryTool {
    pub fn new(index: Arc<IndexCacheManager>, shared: bool) -> Self {
        Self { index, shared }
    }

    fn partition(&self, session_id: &str) -> PartitionId {
        if self.shared {
            PartitionId::Memory
        } else {
            PartitionId::Session(session_id.to_string())
        }
    }
}

#[async_trait]
impl Tool for QueryMemoryTool {
    fn name(&self) -> &str {
        "query_memory"
    }

    fn description(&self) -> &str {
        "Searches and retrieves relevant content from conversation history and memory. Use this to recall \
         past conversations, user preferences, or previous interactions. This is specifically for accessing \
         conversation memory, not for searching documents like reviews or orders."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The specific question or topic to search for in conversation history (e.g. 'user preferences', 'previous orders discussed')."
                }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args["query"].as_str().unwrap_or_default();
        let partition = self.partition(&ctx.session_id);
        let retriever = self.index.refresh(&partition, false).await;
        let hits = retriever
            .search(query)
            .await
            .map_err(|e| ToolError::runtime(format!("Failed to query memory: {e}")))?;

        let results: Vec<Value> = hits
            .into_iter()
            .filter(|h| self.shared || h.passage.meta_str("session_id") == Some(ctx.session_id.as_str()))
            .map(|h| {
                json!({
                    "content": h.passage.text,
                    "source": "conversation_history",
                    "metadata": {
                        "session_id": h.passage.metadata.get("session_id").cloned().unwrap_or(Value::Null),
                        "document_type": h.passage.metadata.get("document_type").cloned().unwrap_or(Value::Null),
                        "timestamp": h.passage.metadata.get("timestamp").cloned().unwrap_or(Value::Null),
                    }
                })
            })
            .collect();

        tracing::info!(partition = %partition, results = results.len(), "memory queried");
        if results.is_empty() {
            return Ok(json!({ "message": NO_MEMORY }));
        }
        Ok(Value::Array(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use crate::memory::{Message, SessionFile, SourceConfig};
    use tempfile::TempDir;

    async fn setup(dir: &TempDir, shared: bool) -> QueryMemoryTool {
        let history = dir.path().join("history");
        SessionFile::for_session(&history, "alice").unwrap()
            .write_all(&[
                Message::system("sys").with_sequence(1),
                Message::user("I love pineapple on pizza").with_sequence(2),
            ])
            .await
            .unwrap();
        SessionFile::for_session(&history, "bob").unwrap()
            .write_all(&[Message::user("pineapple is wrong").with_sequence(1)])
            .await
            .unwrap();
        let index = IndexCacheManager::new(dir.path().join("db"), Arc::new(HashingEmbedder::default()))
            .with_sources(SourceConfig {
                document_patterns: vec![],
                history_dir: Some(history),
            });
        QueryMemoryTool::new(Arc::new(index), shared)
    }

    #[tokio::test]
    async fn test_isolated_mode_only_sees_own_session() {
        let dir = TempDir::new().unwrap();
        let tool = setup(&dir, false).await;
        let out = tool
            .invoke(json!({"query": "pineapple"}), &ToolContext::new("alice"))
            .await
            .unwrap();
        let items = out.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["source"], "conversation_history");
        assert_eq!(items[0]["metadata"]["session_id"], "alice");
        assert_eq!(items[0]["metadata"]["document_type"], "memory");
    }

    #[tokio::test]
    async fn test_shared_mode_sees_all_sessions() {
        let dir = TempDir::new().unwrap();
        let tool = setup(&dir, true).await;
        let out = tool
            .invoke(json!({"query": "pineapple"}), &ToolContext::new("alice"))
            .await
            .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_gets_message() {
        let dir = TempDir::new().unwrap();
        let tool = setup(&dir, false).await;
        let out = tool
            .invoke(json!({"query": "pineapple"}), &ToolContext::new("carol"))
            .await
            .unwrap();
        assert_eq!(out, json!({"message": NO_MEMORY}));
    }
}
