//! LLM 层：生成后端抽象与实现（OpenAI 兼容 / Ollama / Mock）、嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use mock::{MockLlmClient, RecordedCall};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{BackendMessage, ChatReply, LlmClient, LlmError};

/// 按 provider 名创建生成后端：openai | ollama | mock
pub fn create_llm_client(
    provider: &str,
    base_url: Option<&str>,
    model: &str,
    timeout: Duration,
) -> Result<Arc<dyn LlmClient>, LlmError> {
    match provider {
        "mock" => Ok(Arc::new(MockLlmClient::new())),
        "ollama" => Ok(Arc::new(OpenAiClient::new(
            Some(base_url.unwrap_or(openai::OLLAMA_BASE_URL)),
            model,
            None,
            timeout,
        )?)),
        other => {
            if other != "openai" {
                tracing::warn!(provider = other, "unknown llm provider, using openai-compatible client");
            }
            Ok(Arc::new(OpenAiClient::new(base_url, model, None, timeout)?))
        }
    }
}
