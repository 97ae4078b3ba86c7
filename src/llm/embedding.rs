//! 嵌入 API：供索引分区使用，调用 OpenAI 兼容的 /embeddings 端点
//!
//! 离线或未配置密钥时退回 HashingEmbedder（确定性特征哈希），检索仍可用但只按词面相似。

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::IndexError;

/// 嵌入提供方
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 模型标识，写入索引元数据；变化时不触发重建，仅供排查
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let vec = response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default();
        Ok(vec)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

/// 确定性特征哈希嵌入：小写分词后 FNV-1a 落桶，L2 归一化
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    id: String,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(8);
        Self {
            dims,
            id: format!("hashing-{dims}"),
        }
    }

    fn embed_now(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(&token.to_lowercase());
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        Ok(self.embed_now(text))
    }
}

/// 从应用配置创建嵌入提供方：mock 后端或 OpenAI 无密钥时退回 HashingEmbedder
pub fn create_embedder_from_config(
    provider: &str,
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Arc<dyn EmbeddingProvider> {
    let key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.is_empty() && k != "sk-placeholder");

    match provider {
        "mock" => Arc::new(HashingEmbedder::default()),
        "ollama" => Arc::new(OpenAiEmbedder::new(
            Some(base_url.unwrap_or(crate::llm::openai::OLLAMA_BASE_URL)),
            model,
            Some(key.as_deref().unwrap_or("ollama")),
        )),
        _ if key.is_none() && base_url.is_none() => {
            tracing::warn!("embedding: no OPENAI_API_KEY, falling back to hashing embedder");
            Arc::new(HashingEmbedder::default())
        }
        _ => Arc::new(OpenAiEmbedder::new(base_url, model, key.as_deref())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("Large pepperoni pizza").await.unwrap();
        let b = e.embed("large PEPPERONI pizza").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let e = HashingEmbedder::default();
        let v = e.embed("   ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_mock_provider_uses_hashing() {
        let e = create_embedder_from_config("mock", None, "mxbai-embed-large", None);
        assert_eq!(e.model_id(), "hashing-256");
    }
}
