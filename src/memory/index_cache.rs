//! 索引缓存管理
//!
//! 每个分区（documents / memory / memory:<session_id>）持有一个向量存储。`ensure_fresh` 对数据源计算指纹
//! （每个文件的修改时间与字节数，排序后做 SHA-256），与上次持久化的 (指纹, 嵌入模型) 比较，
//! 不一致、分区缺失或 force 时整体重建：解析 → 清空 → 写入 → 持久化元数据。
//!
//! 指纹不看文件内容：大小与修改时间都相同的两个文件互换内容时不会被判定为过期。
//!
//! 每个分区一把 RwLock：重建持写锁，查询持读锁，查询不会看到半成品。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::core::IndexError;
use crate::llm::EmbeddingProvider;
use crate::memory::persistence::SessionFile;
use crate::memory::rag::{Chunker, ChunkingConfig, InMemoryVectorStore, SearchHit, VectorStore};
use crate::memory::sources;

pub const METADATA_FILE: &str = "store_metadata.json";

/// 索引分区
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionId {
    Documents,
    /// 所有会话共享的历史记忆
    Memory,
    /// 单个会话的历史记忆
    Session(String),
}

impl PartitionId {
    /// 快照文件名用的安全形式
    fn file_key(&self) -> String {
        match self {
            PartitionId::Documents => "documents".to_string(),
            PartitionId::Memory => "memory".to_string(),
            PartitionId::Session(sid) => {
                let safe: String = sid
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                    .collect();
                format!("memory_{safe}")
            }
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionId::Documents => f.write_str("documents"),
            PartitionId::Memory => f.write_str("memory"),
            PartitionId::Session(sid) => write!(f, "memory:{sid}"),
        }
    }
}

/// 元数据文件中每个分区一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub files_hash: String,
    pub last_updated: DateTime<Utc>,
    pub embedding_model: String,
    pub store_type: String,
}

/// 计算数据源指纹：与顺序无关，缺失文件也参与（记为 missing）
pub async fn source_fingerprint(sources: &[PathBuf]) -> String {
    let mut entries = Vec::with_capacity(sources.len());
    for path in sources {
        let entry = match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let mtime_ns = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                format!("{}:{}:{}", path.display(), mtime_ns, meta.len())
            }
            Err(_) => format!("{}:missing", path.display()),
        };
        entries.push(entry);
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

struct PartitionState {
    store: InMemoryVectorStore,
    /// 本进程内最近一次成功构建（或恢复）时的 (指纹, 嵌入模型)
    built: Option<(String, String)>,
    build_count: u64,
}

/// 分区检索器；查询时持分区读锁
#[derive(Clone)]
pub struct Retriever {
    partition: PartitionId,
    state: Arc<RwLock<PartitionState>>,
    default_k: usize,
}

impl Retriever {
    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let state = self.state.read().await;
        state.store.query(text, k).await
    }

    /// 以配置的 top_k 查询
    pub async fn search(&self, text: &str) -> Result<Vec<SearchHit>, IndexError> {
        self.query(text, self.default_k).await
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 各分区的数据源位置
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// 文档分区的文件或 glob 模式
    pub document_patterns: Vec<String>,
    /// 会话历史目录（记忆分区数据源）
    pub history_dir: Option<PathBuf>,
}

/// 索引缓存管理器
pub struct IndexCacheManager {
    db_dir: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    snapshots: bool,
    top_k: usize,
    sources: SourceConfig,
    partitions: Mutex<HashMap<PartitionId, Arc<RwLock<PartitionState>>>>,
    metadata_lock: Mutex<()>,
}

impl IndexCacheManager {
    pub fn new(db_dir: impl AsRef<Path>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            db_dir: db_dir.as_ref().to_path_buf(),
            embedder,
            chunker: Chunker::default(),
            snapshots: false,
            top_k: 3,
            sources: SourceConfig::default(),
            partitions: Mutex::new(HashMap::new()),
            metadata_lock: Mutex::new(()),
        }
    }

    /// 启用 JSON 快照：重启后指纹未变的分区直接从快照恢复
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots = enabled;
        self
    }

    pub fn with_chunking(mut self, config: ChunkingConfig) -> Self {
        self.chunker = Chunker::new(config);
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn with_sources(mut self, sources: SourceConfig) -> Self {
        self.sources = sources;
        self
    }

    pub fn embedding_model_id(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.db_dir.join(METADATA_FILE)
    }

    fn snapshot_path(&self, partition: &PartitionId) -> PathBuf {
        self.db_dir.join(format!("{}.vectors.json", partition.file_key()))
    }

    /// 分区当前应使用的数据源文件
    pub fn sources_for(&self, partition: &PartitionId) -> Vec<PathBuf> {
        match partition {
            PartitionId::Documents => sources::expand_sources(&self.sources.document_patterns),
            PartitionId::Memory => self
                .sources
                .history_dir
                .as_deref()
                .map(sources::history_files)
                .unwrap_or_default(),
            PartitionId::Session(sid) => {
                let Some(dir) = self.sources.history_dir.as_deref() else {
                    return Vec::new();
                };
                match SessionFile::for_session(dir, sid) {
                    Ok(file) => vec![file.path().to_path_buf()],
                    Err(e) => {
                        tracing::warn!(partition = %partition, "no history source: {}", e);
                        Vec::new()
                    }
                }
            }
        }
    }

    /// 以配置的数据源与当前嵌入模型刷新分区
    pub async fn refresh(&self, partition: &PartitionId, force: bool) -> Retriever {
        let sources = self.sources_for(partition);
        let model = self.embedding_model_id().to_string();
        self.ensure_fresh(partition, &sources, &model, force).await
    }

    async fn partition(&self, partition: &PartitionId) -> Arc<RwLock<PartitionState>> {
        let mut partitions = self.partitions.lock().await;
        partitions
            .entry(partition.clone())
            .or_insert_with(|| {
                let mut store = InMemoryVectorStore::new(self.embedder.clone());
                if self.snapshots {
                    store = store.with_snapshot(self.snapshot_path(partition));
                }
                Arc::new(RwLock::new(PartitionState {
                    store,
                    built: None,
                    build_count: 0,
                }))
            })
            .clone()
    }

    /// 保证分区与数据源一致后返回检索器；构建失败时记录告警并返回现有（可能为空）内容
    pub async fn ensure_fresh(
        &self,
        partition: &PartitionId,
        sources: &[PathBuf],
        embedding_model: &str,
        force: bool,
    ) -> Retriever {
        let state = self.partition(partition).await;
        {
            let mut guard = state.write().await;
            let current = (source_fingerprint(sources).await, embedding_model.to_string());

            if force || guard.built.as_ref() != Some(&current) {
                let restored = !force
                    && guard.built.is_none()
                    && self.try_restore(partition, &mut guard, &current).await;
                if !restored {
                    self.rebuild(partition, &mut guard, sources, current, force).await;
                }
            } else {
                tracing::debug!(partition = %partition, "index partition is fresh");
            }
        }
        Retriever {
            partition: partition.clone(),
            state,
            default_k: self.top_k,
        }
    }

    async fn try_restore(
        &self,
        partition: &PartitionId,
        guard: &mut PartitionState,
        current: &(String, String),
    ) -> bool {
        if !self.snapshots {
            return false;
        }
        let metadata = self.read_metadata().await;
        let Some(entry) = metadata.get(&partition.to_string()) else {
            return false;
        };
        if entry.files_hash != current.0 || entry.embedding_model != current.1 {
            return false;
        }
        match guard.store.restore().await {
            Ok(true) => {
                tracing::info!(partition = %partition, entries = guard.store.len(), "index partition restored from snapshot");
                guard.built = Some(current.clone());
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(partition = %partition, "failed to restore snapshot: {}", e);
                false
            }
        }
    }

    async fn rebuild(
        &self,
        partition: &PartitionId,
        guard: &mut PartitionState,
        sources: &[PathBuf],
        current: (String, String),
        force: bool,
    ) {
        let parsed = match partition {
            PartitionId::Documents => sources::parse_documents(sources, &self.chunker).await,
            PartitionId::Memory | PartitionId::Session(_) => sources::parse_memory(sources).await,
        };
        let passages = match parsed {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(partition = %partition, "index rebuild failed while parsing sources: {}", e);
                return;
            }
        };

        let count = passages.len();
        if let Err(e) = guard.store.delete_all().await {
            tracing::warn!(partition = %partition, "failed to clear index partition: {}", e);
            guard.built = None;
            return;
        }
        if let Err(e) = guard.store.add(passages).await {
            tracing::warn!(partition = %partition, "failed to populate index partition: {}", e);
            guard.built = None;
            return;
        }

        guard.build_count += 1;
        let entry = PartitionMetadata {
            files_hash: current.0.clone(),
            last_updated: Utc::now(),
            embedding_model: current.1.clone(),
            store_type: guard.store.store_type().to_string(),
        };
        guard.built = Some(current);
        tracing::info!(
            partition = %partition,
            passages = count,
            sources = sources.len(),
            force,
            "index partition rebuilt"
        );

        if let Err(e) = self.write_metadata_entry(partition, Some(entry)).await {
            tracing::warn!(partition = %partition, "failed to persist index metadata: {}", e);
        }
    }

    /// 本进程内该分区的重建次数
    pub async fn build_count(&self, partition: &PartitionId) -> u64 {
        let state = self.partitions.lock().await.get(partition).cloned();
        match state {
            Some(s) => s.read().await.build_count,
            None => 0,
        }
    }

    /// 删除分区：清空存储、删除快照与元数据记录；不存在时视为成功
    pub async fn drop_partition(&self, partition: &PartitionId) -> Result<(), IndexError> {
        let state = self.partitions.lock().await.remove(partition);
        if let Some(state) = state {
            let mut guard = state.write().await;
            guard.store.delete_all().await?;
            guard.store.remove_snapshot().await?;
            guard.built = None;
        } else if self.snapshots {
            InMemoryVectorStore::new(self.embedder.clone())
                .with_snapshot(self.snapshot_path(partition))
                .remove_snapshot()
                .await?;
        }
        self.write_metadata_entry(partition, None).await?;
        tracing::info!(partition = %partition, "index partition dropped");
        Ok(())
    }

    /// 读取元数据文件；不存在或损坏时视为空
    pub async fn read_metadata(&self) -> BTreeMap<String, PartitionMetadata> {
        match tokio::fs::read_to_string(self.metadata_path()).await {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("index metadata unreadable, ignoring: {}", e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    async fn write_metadata_entry(
        &self,
        partition: &PartitionId,
        entry: Option<PartitionMetadata>,
    ) -> Result<(), IndexError> {
        let _lock = self.metadata_lock.lock().await;
        let mut metadata = self.read_metadata().await;
        let key = partition.to_string();
        match entry {
            Some(e) => {
                metadata.insert(key, e);
            }
            None => {
                if metadata.remove(&key).is_none() {
                    return Ok(());
                }
            }
        }
        tokio::fs::create_dir_all(&self.db_dir).await?;
        let path = self.metadata_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&metadata)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use crate::memory::persistence::SessionFile;
    use crate::memory::Message;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn manager(dir: &Path) -> IndexCacheManager {
        IndexCacheManager::new(dir.join("db"), Arc::new(HashingEmbedder::default()))
    }

    fn set_mtime(path: &Path, t: SystemTime) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(t)
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_call_does_not_rebuild() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("reviews.csv");
        std::fs::write(&src, "Title,Review\nGood,Crispy crust\n").unwrap();
        let mgr = manager(dir.path());
        let sources = vec![src];

        let r1 = mgr.ensure_fresh(&PartitionId::Documents, &sources, "m1", false).await;
        let r2 = mgr.ensure_fresh(&PartitionId::Documents, &sources, "m1", false).await;
        assert_eq!(mgr.build_count(&PartitionId::Documents).await, 1);
        assert_eq!(r1.len().await, 1);
        assert_eq!(r2.len().await, 1);

        let meta = mgr.read_metadata().await;
        let entry = &meta["documents"];
        assert_eq!(entry.embedding_model, "m1");
        assert_eq!(entry.store_type, "in_memory");
    }

    #[tokio::test]
    async fn test_changes_force_and_model_trigger_rebuild() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("notes.txt");
        std::fs::write(&src, "thin crust").unwrap();
        let mgr = manager(dir.path());
        let sources = vec![src.clone()];
        let p = PartitionId::Documents;

        mgr.ensure_fresh(&p, &sources, "m1", false).await;
        std::fs::write(&src, "thin crust and extra cheese").unwrap();
        mgr.ensure_fresh(&p, &sources, "m1", false).await;
        assert_eq!(mgr.build_count(&p).await, 2);

        mgr.ensure_fresh(&p, &sources, "m1", true).await;
        assert_eq!(mgr.build_count(&p).await, 3);

        mgr.ensure_fresh(&p, &sources, "m2", false).await;
        assert_eq!(mgr.build_count(&p).await, 4);
    }

    #[tokio::test]
    async fn test_swapped_files_with_same_size_and_mtime_are_not_stale() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "aaaa").unwrap();
        std::fs::write(&b, "bbbb").unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&a, t);
        set_mtime(&b, t);

        let mgr = manager(dir.path());
        let sources = vec![a.clone(), b.clone()];
        mgr.ensure_fresh(&PartitionId::Documents, &sources, "m", false).await;

        std::fs::write(&a, "bbbb").unwrap();
        std::fs::write(&b, "aaaa").unwrap();
        set_mtime(&a, t);
        set_mtime(&b, t);
        mgr.ensure_fresh(&PartitionId::Documents, &sources, "m", false).await;

        assert_eq!(mgr.build_count(&PartitionId::Documents).await, 1);
    }

    #[tokio::test]
    async fn test_fingerprint_is_order_independent() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "bb").unwrap();
        assert_eq!(
            source_fingerprint(&[a.clone(), b.clone()]).await,
            source_fingerprint(&[b, a]).await
        );
    }

    #[tokio::test]
    async fn test_empty_sources_give_queryable_retriever() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());
        let r = mgr.ensure_fresh(&PartitionId::Memory, &[], "m", false).await;
        assert!(r.is_empty().await);
        assert!(r.search("anything").await.unwrap().is_empty());
        assert_eq!(r.partition().to_string(), "memory");
    }

    #[test]
    fn test_session_partition_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path()).with_sources(SourceConfig {
            document_patterns: vec![],
            history_dir: Some(dir.path().join("history")),
        });
        let ok = mgr.sources_for(&PartitionId::Session("s1".into()));
        assert_eq!(ok, vec![dir.path().join("history").join("s1.jsonl")]);
        assert!(mgr.sources_for(&PartitionId::Session("../secrets".into())).is_empty());
    }

    #[tokio::test]
    async fn test_session_partition_uses_only_its_history() {
        let dir = TempDir::new().unwrap();
        let history = dir.path().join("history");
        SessionFile::for_session(&history, "s1").unwrap()
            .write_all(&[
                Message::system("sys").with_sequence(1),
                Message::user("pepperoni please").with_sequence(2),
            ])
            .await
            .unwrap();
        SessionFile::for_session(&history, "s2").unwrap()
            .write_all(&[Message::user("pepperoni for me too").with_sequence(1)])
            .await
            .unwrap();

        let mgr = manager(dir.path()).with_sources(SourceConfig {
            document_patterns: vec![],
            history_dir: Some(history),
        });
        let session = PartitionId::Session("s1".into());
        assert_eq!(session.to_string(), "memory:s1");
        let r = mgr.refresh(&session, false).await;
        let hits = r.query("pepperoni", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage.meta_str("session_id"), Some("s1"));

        let shared = mgr.refresh(&PartitionId::Memory, false).await;
        assert_eq!(shared.len().await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_restores_without_rebuild_and_drop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("orders.jsonl");
        std::fs::write(&src, "{\"pizza_type\":\"Margherita\"}\n").unwrap();
        let sources = vec![src];
        let p = PartitionId::Documents;

        let first = manager(dir.path()).with_snapshots(true);
        first.ensure_fresh(&p, &sources, "hashing-256", false).await;
        assert_eq!(first.build_count(&p).await, 1);

        let second = manager(dir.path()).with_snapshots(true);
        let r = second.ensure_fresh(&p, &sources, "hashing-256", false).await;
        assert_eq!(second.build_count(&p).await, 0);
        assert_eq!(r.len().await, 1);

        second.drop_partition(&p).await.unwrap();
        second.drop_partition(&p).await.unwrap();
        assert!(second.read_metadata().await.get("documents").is_none());
        assert!(!dir.path().join("db/documents.vectors.json").exists());
    }

    #[tokio::test]
    async fn test_concurrent_callers_build_once() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("reviews.csv");
        std::fs::write(&src, "Title\nGreat\n").unwrap();
        let mgr = Arc::new(manager(dir.path()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = mgr.clone();
            let sources = vec![src.clone()];
            handles.push(tokio::spawn(async move {
                mgr.ensure_fresh(&PartitionId::Documents, &sources, "m", false)
                    .await
                    .len()
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
        assert_eq!(mgr.build_count(&PartitionId::Documents).await, 1);
    }
}
