//! 记忆层：对话模型、规范化、会话存储与持久化、检索索引

pub mod canonical;
pub mod conversation;
pub mod index_cache;
pub mod persistence;
pub mod rag;
pub mod session_store;
pub mod sources;

pub use canonical::{canonical_content, canonical_string, canonicalize, fingerprint, to_canonical};
pub use conversation::{Message, RawArguments, Role, ToolCall};
pub use index_cache::{IndexCacheManager, PartitionId, PartitionMetadata, Retriever, SourceConfig};
pub use persistence::{validate_session_id, SessionFile};
pub use rag::{Chunker, ChunkingConfig, InMemoryVectorStore, Passage, SearchHit, VectorStore};
pub use session_store::{SessionStore, DEFAULT_MAX_HISTORY};
