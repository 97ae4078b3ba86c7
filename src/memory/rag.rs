//! 检索基础设施
//!
//! 文档分块、向量存储与相似度检索。索引分区（见 index_cache）各自持有一个 VectorStore，
//! 重建时整体清空后重新写入。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::IndexError;
use crate::llm::EmbeddingProvider;

/// 可检索的文本单元（带稳定 id 与元数据）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Passage {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                "。".to_string(),
                ". ".to_string(),
                "! ".to_string(),
                "? ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// 将文本分割为块（UTF-8 安全），id 为 `<doc_id>:<n>`，元数据带字节偏移
    pub fn chunk(&self, doc_id: &str, text: &str) -> Vec<Passage> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let total_chars = chars.len();
        let chunk_size = self.config.chunk_size.max(1);

        let mut current_idx = 0;
        let mut chunk_idx = 0;

        while current_idx < total_chars {
            let target_end = (current_idx + chunk_size).min(total_chars);
            let mut actual_end = target_end;

            // 不在文末时尽量在分隔符处断开
            if target_end < total_chars {
                let slice: String = chars[current_idx..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let chars_to_sep = slice[..pos].chars().count() + sep.chars().count();
                        if chars_to_sep > 0 {
                            actual_end = current_idx + chars_to_sep;
                            break;
                        }
                    }
                }
            }

            if actual_end <= current_idx {
                actual_end = (current_idx + 1).min(total_chars);
            }

            let chunk_text: String = chars[current_idx..actual_end].iter().collect();
            let trimmed = chunk_text.trim();
            if !trimmed.is_empty() {
                let byte_offset: usize = chars[..current_idx].iter().map(|c| c.len_utf8()).sum();
                chunks.push(
                    Passage::new(format!("{doc_id}:{chunk_idx}"), trimmed)
                        .with_metadata("offset", byte_offset as u64),
                );
                chunk_idx += 1;
            }

            if actual_end >= total_chars {
                break;
            }
            let overlap = self.config.chunk_overlap.min(actual_end - current_idx);
            let next_start = actual_end.saturating_sub(overlap);
            current_idx = if next_start > current_idx {
                next_start
            } else {
                actual_end
            };
        }

        chunks
    }
}

/// 检索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub passage: Passage,
    pub score: f32,
}

/// 向量存储抽象
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 写入元数据的存储类型标识
    fn store_type(&self) -> &str;

    async fn add(&mut self, passages: Vec<Passage>) -> Result<usize, IndexError>;

    async fn delete_all(&mut self) -> Result<(), IndexError>;

    /// 按相似度降序返回至多 k 条
    async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, IndexError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    passage: Passage,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    embedding_model: String,
    entries: Vec<SnapshotEntry>,
}

/// 内存向量存储，可选落盘为 JSON 快照（每个分区一个文件）
pub struct InMemoryVectorStore {
    entries: Vec<SnapshotEntry>,
    embedder: Arc<dyn EmbeddingProvider>,
    snapshot: Option<PathBuf>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            entries: Vec::new(),
            embedder,
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, path: impl AsRef<Path>) -> Self {
        self.snapshot = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// 从快照恢复；返回是否找到快照
    pub async fn restore(&mut self) -> Result<bool, IndexError> {
        let Some(path) = &self.snapshot else {
            return Ok(false);
        };
        let data = match tokio::fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&data)?;
        if snapshot.embedding_model != self.embedder.model_id() {
            tracing::warn!(
                path = %path.display(),
                snapshot_model = %snapshot.embedding_model,
                current_model = %self.embedder.model_id(),
                "vector snapshot built with a different embedding model"
            );
        }
        self.entries = snapshot.entries;
        Ok(true)
    }

    /// 删除快照文件（不存在视为成功）
    pub async fn remove_snapshot(&self) -> Result<(), IndexError> {
        if let Some(path) = &self.snapshot {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), IndexError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let snapshot = Snapshot {
            embedding_model: self.embedder.model_id().to_string(),
            entries: self.entries.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&snapshot)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn store_type(&self) -> &str {
        if self.snapshot.is_some() {
            "json_snapshot"
        } else {
            "in_memory"
        }
    }

    async fn add(&mut self, passages: Vec<Passage>) -> Result<usize, IndexError> {
        if passages.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != passages.len() {
            return Err(IndexError::Embedding(format!(
                "expected {} embeddings, got {}",
                passages.len(),
                embeddings.len()
            )));
        }
        let added = passages.len();
        self.entries.extend(
            passages
                .into_iter()
                .zip(embeddings)
                .map(|(passage, embedding)| SnapshotEntry { passage, embedding }),
        );
        self.persist().await?;
        Ok(added)
    }

    async fn delete_all(&mut self) -> Result<(), IndexError> {
        self.entries.clear();
        self.persist().await
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(text).await?;
        if query_embedding.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, &Passage)> = self
            .entries
            .iter()
            .map(|e| (cosine_similarity(&query_embedding, &e.embedding), &e.passage))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, passage)| SearchHit {
                passage: passage.clone(),
                score,
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use tempfile::TempDir;

    #[test]
    fn test_chunking() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 10,
            ..Default::default()
        });
        let text = "The crust was crisp. The sauce was sweet.\n\nDelivery took an hour. Cold on arrival.";
        let chunks = chunker.chunk("reviews", text);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].id, "reviews:0");
        assert_eq!(chunks[1].id, "reviews:1");
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = Chunker::default().chunk("note", "  short note  ");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short note");
        assert!(Chunker::default().chunk("empty", "").is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let mut store = InMemoryVectorStore::new(Arc::new(HashingEmbedder::default()));
        store
            .add(vec![
                Passage::new("a", "pepperoni pizza was great"),
                Passage::new("b", "delivery driver was late"),
            ])
            .await
            .unwrap();
        let hits = store.query("late delivery", 3).await.unwrap();
        assert_eq!(hits[0].passage.id, "b");
        assert_eq!(store.store_type(), "in_memory");

        store.delete_all().await.unwrap();
        assert!(store.is_empty());
        assert!(store.query("late", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("documents.json");
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());

        let mut store = InMemoryVectorStore::new(embedder.clone()).with_snapshot(&path);
        store
            .add(vec![Passage::new("a", "thin crust").with_metadata("document_type", "review")])
            .await
            .unwrap();
        assert_eq!(store.store_type(), "json_snapshot");

        let mut reopened = InMemoryVectorStore::new(embedder).with_snapshot(&path);
        assert!(reopened.restore().await.unwrap());
        assert_eq!(reopened.len(), 1);
        let hits = reopened.query("crust", 1).await.unwrap();
        assert_eq!(hits[0].passage.meta_str("document_type"), Some("review"));

        reopened.remove_snapshot().await.unwrap();
        assert!(!path.exists());
    }
}
