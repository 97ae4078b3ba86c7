//! 文档检索工具：每次调用先确保 documents 分区新鲜（新下的订单会被重新索引）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::memory::{IndexCacheManager, PartitionId};
use crate::tools::{Tool, ToolContext};

pub const NO_DOCUMENTS: &str = "No relevant documents found for your query.";

pub struct QueryDocumentsTool {
    index: Arc<IndexCacheManager>,
}

impl QueryDocumentsTool {
    pub fn new(index: Arc<IndexCacheManager>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for QueryDocumentsTool {
    fn name(&self) -> &str {
        "query_documents"
    }

    fn description(&self) -> &str {
        "Searches and retrieves relevant content from any indexed document (reviews, orders, or other files) \
         based on a query. Useful for answering questions about food, service, price, atmosphere, orders, or \
         any information present in the indexed files. Do NOT use this to place an order."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The specific question or topic to search for in the documents (e.g. 'pepperoni pizza quality', 'service speed', 'comments about the crust')."
                }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args["query"].as_str().unwrap_or_default();
        let retriever = self.index.refresh(&PartitionId::Documents, false).await;
        let hits = retriever
            .search(query)
            .await
            .map_err(|e| ToolError::runtime(format!("Failed to query documents: {e}")))?;

        tracing::info!(query, results = hits.len(), "documents queried");
        if hits.is_empty() {
            return Ok(json!({ "message": NO_DOCUMENTS }));
        }
        Ok(Value::Array(
            hits.into_iter()
                .map(|h| json!({ "content": h.passage.text, "metadata": h.passage.metadata }))
                .collect(),
        ))
    }
}
