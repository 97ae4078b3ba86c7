//! 进程级 Agent 对象
//!
//! 启动时由配置一次性构建会话存储、索引缓存、工具注册表、执行器、生成后端与编排器，
//! 之后所有会话共享同一份组件。传输层（CLI / WebSocket 等）只需持有 [`Agent`]。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{AgentError, Orchestrator, TurnStream};
use crate::llm::{create_embedder_from_config, create_llm_client, LlmClient};
use crate::memory::{ChunkingConfig, IndexCacheManager, PartitionId, SessionStore, SourceConfig};
use crate::react::CorrelationIds;
use crate::tools::{
    PlaceOrderTool, QueryDocumentsTool, QueryMemoryTool, ToolExecutor, ToolRegistry,
};

pub struct Agent {
    orchestrator: Orchestrator,
    index: Arc<IndexCacheManager>,
    shared_memory: bool,
}

impl Agent {
    /// 按配置构建全部组件（生成后端由 llm.provider 选择）
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let llm = create_llm_client(
            &cfg.llm.provider,
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            Duration::from_secs(cfg.llm.timeouts.request),
        )?;
        Self::with_llm(cfg, llm)
    }

    /// 使用给定生成后端构建（测试或自定义后端）
    pub fn with_llm(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Result<Self, AgentError> {
        let mut store = SessionStore::new(cfg.session.max_history);
        if cfg.session.persist {
            store = store.with_history_dir(&cfg.session.history_dir);
        }
        let store = Arc::new(store);

        let embedder = create_embedder_from_config(
            &cfg.llm.provider,
            cfg.embedding.base_url.as_deref().or(cfg.llm.base_url.as_deref()),
            &cfg.embedding.model,
            None,
        );
        let chunking = ChunkingConfig {
            chunk_size: cfg.index.chunk_size,
            chunk_overlap: cfg.index.chunk_overlap,
            ..ChunkingConfig::default()
        };
        let index = Arc::new(
            IndexCacheManager::new(&cfg.index.db_dir, embedder)
                .with_snapshots(true)
                .with_chunking(chunking)
                .with_top_k(cfg.index.top_k)
                .with_sources(SourceConfig {
                    document_patterns: cfg.index.sources.clone(),
                    history_dir: cfg
                        .session
                        .persist
                        .then(|| cfg.session.history_dir.clone()),
                }),
        );

        let mut registry = ToolRegistry::new();
        registry
            .register(PlaceOrderTool::new(&cfg.tools.order_file))
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;
        registry
            .register(QueryDocumentsTool::new(index.clone()))
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;
        registry
            .register(QueryMemoryTool::new(index.clone(), cfg.index.shared_memory))
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            cfg.tools.tool_timeout_secs,
        ));

        let orchestrator = Orchestrator::new(llm, executor.clone(), store)
            .with_system_prompt(cfg.app.resolve_system_prompt());

        tracing::info!(
            provider = %cfg.llm.provider,
            model = %cfg.llm.model,
            tools = ?executor.tool_names(),
            embedding = index.embedding_model_id(),
            "agent initialized"
        );

        Ok(Self {
            orchestrator,
            index,
            shared_memory: cfg.index.shared_memory,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn index(&self) -> &Arc<IndexCacheManager> {
        &self.index
    }

    /// 预建文档分区，首个 query_documents 调用不必等待构建
    pub async fn warm_up(&self) -> usize {
        let retriever = self.index.refresh(&PartitionId::Documents, false).await;
        let n = retriever.len().await;
        tracing::info!(passages = n, "documents partition ready");
        n
    }

    pub fn run_turn(
        &self,
        session_id: impl Into<String>,
        user_text: impl Into<String>,
        ids: Option<CorrelationIds>,
    ) -> TurnStream {
        self.orchestrator.run_turn(session_id, user_text, ids)
    }

    /// 会话结束：保存并移出内存，拆除该会话私有的记忆分区
    pub async fn end_session(&self, session_id: &str) -> Result<(), AgentError> {
        self.orchestrator.end_session(session_id).await?;
        if !self.shared_memory {
            if let Err(e) = self
                .index
                .drop_partition(&PartitionId::Session(session_id.to_string()))
                .await
            {
                tracing::warn!(session_id, "Failed to drop memory partition: {}", e);
            }
        }
        Ok(())
    }
}
