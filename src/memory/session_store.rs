//! 会话存储
//!
//! 按 session_id 保存有序消息：固定的 system 消息永远排在最前且不计入保留上限，
//! 其余历史每次插入后截断到最近 `max_history` 条；会话内 sequence 单调递增且不复用。
//!
//! 并发：外层 RwLock 只保护 session 表，每个会话一把 Mutex，只在读写历史时持有，
//! 不同会话互不阻塞。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::StoreError;
use crate::memory::canonical::fingerprint;
use crate::memory::persistence::SessionFile;
use crate::memory::{Message, Role};

/// 默认保留的非 system 消息条数
pub const DEFAULT_MAX_HISTORY: usize = 15;

/// 单个会话的状态（只由 SessionStore 持有）
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub conversation_id: Uuid,
    system_message: Option<Message>,
    history: Vec<Message>,
    /// 已分配出去的最大序号（消息与事件共用）
    sequence_counter: u64,
    /// 已写入消息的最大序号
    last_sequence: u64,
    tool_attempt_counts: HashMap<String, u32>,
    /// 磁盘记录恢复失败：拒绝写入，直到 load / clear 成功
    restore_failed: bool,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            conversation_id: Uuid::new_v4(),
            system_message: None,
            history: Vec::new(),
            sequence_counter: 0,
            last_sequence: 0,
            tool_attempt_counts: HashMap::new(),
            restore_failed: false,
        }
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.restore_failed {
            return Err(StoreError::RestoreFailed(self.session_id.clone()));
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence_counter += 1;
        self.sequence_counter
    }

    fn is_empty(&self) -> bool {
        self.system_message.is_none() && self.history.is_empty()
    }

    fn last_message_id(&self) -> Option<Uuid> {
        self.history
            .last()
            .or(self.system_message.as_ref())
            .map(|m| m.message_id)
    }

    /// system 在前的完整快照
    fn snapshot(&self) -> Vec<Message> {
        self.system_message
            .iter()
            .chain(self.history.iter())
            .cloned()
            .collect()
    }

    /// 校验并补全一条消息（序号、conversation_id）
    fn prepare(&mut self, mut message: Message) -> Result<Message, StoreError> {
        if message.role == Role::Tool && message.tool_call_id.is_none() {
            return Err(StoreError::InvalidMessage(
                "tool message without tool_call_id".to_string(),
            ));
        }
        if message.sequence == 0 {
            message.sequence = self.next_sequence();
        } else if message.sequence <= self.last_sequence {
            return Err(StoreError::SequenceViolation {
                session_id: self.session_id.clone(),
                last: self.last_sequence,
                got: message.sequence,
            });
        }
        if message.conversation_id.is_nil() {
            message.conversation_id = self.conversation_id;
        }
        self.last_sequence = message.sequence;
        self.sequence_counter = self.sequence_counter.max(message.sequence);
        Ok(message)
    }

    /// 固定 system 消息总排在最前，序号不能大于其后的历史：
    /// 替换时沿用原序号；历史已存在时取 0（排在所有已分配序号之前）
    fn pin_system(&mut self, mut message: Message) -> Result<Message, StoreError> {
        message.role = Role::System;
        let existing = self.system_message.as_ref().map(|m| m.sequence);
        match existing {
            None if self.history.is_empty() => return self.prepare(message),
            Some(seq) => message.sequence = seq,
            None => message.sequence = 0,
        }
        if message.conversation_id.is_nil() {
            message.conversation_id = self.conversation_id;
        }
        Ok(message)
    }

    fn apply(&mut self, message: Message, max_history: usize) -> Result<Message, StoreError> {
        if message.is_system() {
            let message = self.pin_system(message)?;
            self.system_message = Some(message.clone());
            return Ok(message);
        }
        let message = self.prepare(message)?;
        {
            self.history.push(message.clone());
            if self.history.len() > max_history {
                let excess = self.history.len() - max_history;
                self.history.drain(..excess);
            }
        }
        Ok(message)
    }
}

/// 会话存储：进程内共享，构造后通过 Arc 传给编排器
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
    max_history: usize,
    history_dir: Option<PathBuf>,
}

impl SessionStore {
    /// 纯内存存储
    pub fn new(max_history: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_history: max_history.max(1),
            history_dir: None,
        }
    }

    /// 启用 JSONL 持久化（`<dir>/<session_id>.jsonl`）
    pub fn with_history_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.history_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn history_dir(&self) -> Option<&Path> {
        self.history_dir.as_deref()
    }

    /// 会话的持久化文件路径（未启用持久化或 id 非法时为 None）
    pub fn history_path(&self, session_id: &str) -> Option<PathBuf> {
        self.file(session_id)
            .ok()
            .flatten()
            .map(|f| f.path().to_path_buf())
    }

    /// 未启用持久化时为 Ok(None)；session_id 不能作文件名时报错
    fn file(&self, session_id: &str) -> Result<Option<SessionFile>, StoreError> {
        self.history_dir
            .as_deref()
            .map(|dir| SessionFile::for_session(dir, session_id))
            .transpose()
    }

    /// 取得会话句柄；首次访问时从磁盘恢复
    async fn session(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(s) = self.sessions.read().await.get(session_id) {
            return s.clone();
        }

        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get(session_id) {
            return s.clone();
        }
        let handle = Arc::new(Mutex::new(SessionState::new(session_id)));
        // 先锁住再放进表里，其他调用方会等到恢复完成
        let mut guard = handle.clone().lock_owned().await;
        sessions.insert(session_id.to_string(), handle.clone());
        drop(sessions);

        if let Ok(Some(file)) = self.file(session_id) {
            let restored = match file.load().await {
                Ok(records) if records.is_empty() => Ok(None),
                Ok(records) => restore(session_id, records, self.max_history).map(Some),
                Err(e) => Err(e),
            };
            match restored {
                Ok(Some(state)) => {
                    tracing::debug!(session_id, "restored session from disk");
                    *guard = state;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(session_id, "Failed to restore session, refusing writes: {}", e);
                    guard.restore_failed = true;
                }
            }
        }
        drop(guard);
        handle
    }

    /// 追加一条消息：校验、截断、追加写盘。role=system 等同 set_system_message
    pub async fn add_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<Message, StoreError> {
        if message.is_system() {
            return self.set_system_message(session_id, message).await;
        }
        let file = self.file(session_id)?;
        let handle = self.session(session_id).await;
        let mut state = handle.lock().await;
        state.ensure_writable()?;
        // 写盘成功后才提交内存状态
        let mut staged = state.clone();
        let stored = staged.apply(message, self.max_history)?;
        if let Some(file) = file {
            file.append(&stored).await?;
        }
        *state = staged;
        tracing::debug!(
            session_id,
            role = stored.role.as_str(),
            sequence = stored.sequence,
            "message added"
        );
        Ok(stored)
    }

    /// 设置（或替换）固定的 system 消息；写整份快照以保证 system 记录在文件首行
    pub async fn set_system_message(
        &self,
        session_id: &str,
        mut message: Message,
    ) -> Result<Message, StoreError> {
        message.role = Role::System;
        let file = self.file(session_id)?;
        let handle = self.session(session_id).await;
        let mut state = handle.lock().await;
        state.ensure_writable()?;
        let mut staged = state.clone();
        let stored = staged.apply(message, self.max_history)?;
        if let Some(file) = file {
            file.write_all(&staged.snapshot()).await?;
        }
        *state = staged;
        Ok(stored)
    }

    /// system 消息（若有）+ 最近 `count` 条非 system 消息；count 为 None 时返回全部
    pub async fn get_recent_messages(&self, session_id: &str, count: Option<usize>) -> Vec<Message> {
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        let start = match count {
            Some(n) => state.history.len().saturating_sub(n),
            None => 0,
        };
        state
            .system_message
            .iter()
            .chain(state.history[start..].iter())
            .cloned()
            .collect()
    }

    pub async fn system_message(&self, session_id: &str) -> Option<Message> {
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        state.system_message.clone()
    }

    /// 分配下一个序号（消息与事件共用计数器）
    pub async fn next_sequence(&self, session_id: &str) -> u64 {
        let handle = self.session(session_id).await;
        let mut state = handle.lock().await;
        state.next_sequence()
    }

    /// 记录一次工具调用尝试，返回该指纹累计次数
    pub async fn record_attempt(&self, session_id: &str, function_name: &str, args: &Value) -> u32 {
        self.record_fingerprint(session_id, &fingerprint(function_name, args))
            .await
    }

    pub async fn record_fingerprint(&self, session_id: &str, fingerprint: &str) -> u32 {
        let handle = self.session(session_id).await;
        let mut state = handle.lock().await;
        let count = state
            .tool_attempt_counts
            .entry(fingerprint.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    pub async fn attempt_count(&self, session_id: &str, fingerprint: &str) -> u32 {
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        state
            .tool_attempt_counts
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }

    pub async fn conversation_id(&self, session_id: &str) -> Uuid {
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        state.conversation_id
    }

    /// 最后一条消息的 id，作为下一轮 user 消息的 parent_id
    pub async fn last_message_id(&self, session_id: &str) -> Option<Uuid> {
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        state.last_message_id()
    }

    /// 会话是否还没有任何消息（用于首条消息前插入 system prompt）
    pub async fn is_new(&self, session_id: &str) -> bool {
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        state.is_empty()
    }

    /// 批量恢复：逐条校验，全部成功后才提交并只写一次盘；任一条失败则会话保持原状
    pub async fn batch_load(
        &self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<usize, StoreError> {
        let file = self.file(session_id)?;
        let handle = self.session(session_id).await;
        let mut state = handle.lock().await;
        state.ensure_writable()?;
        let mut staged = state.clone();
        let count = messages.len();
        for msg in messages {
            staged.apply(msg, self.max_history)?;
        }
        if let Some(file) = file {
            file.write_all(&staged.snapshot()).await?;
        }
        *state = staged;
        tracing::info!(session_id, count, "batch loaded messages");
        Ok(count)
    }

    /// 从磁盘重新加载会话（替换内存状态，不触发写盘）
    pub async fn load(&self, session_id: &str) -> Result<usize, StoreError> {
        let Some(file) = self.file(session_id)? else {
            return Ok(0);
        };
        let records = file.load().await?;
        let count = records.len();
        let restored = restore(session_id, records, self.max_history)?;
        let handle = self.session(session_id).await;
        let mut state = handle.lock().await;
        *state = restored;
        Ok(count)
    }

    /// 写整份快照
    pub async fn save(&self, session_id: &str) -> Result<(), StoreError> {
        let Some(file) = self.file(session_id)? else {
            return Ok(());
        };
        let handle = self.session(session_id).await;
        let state = handle.lock().await;
        state.ensure_writable()?;
        file.write_all(&state.snapshot()).await
    }

    /// 清空会话：丢弃内存状态并删除持久化文件
    pub async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(handle) = removed {
            // 等待进行中的写入结束
            let _state = handle.lock().await;
        }
        if let Some(file) = self.file(session_id)? {
            file.remove().await?;
        }
        Ok(())
    }

    /// 会话结束：写快照后从内存移除，磁盘记录保留。
    /// 恢复失败的会话只移出内存，文件不动，下次访问重新尝试恢复
    pub async fn evict(&self, session_id: &str) -> Result<(), StoreError> {
        let Some(handle) = self.sessions.read().await.get(session_id).cloned() else {
            return Ok(());
        };
        let restore_failed = handle.lock().await.restore_failed;
        if restore_failed {
            tracing::warn!(session_id, "evicting unrestored session without saving");
        } else {
            self.save(session_id).await?;
        }
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// 由持久化记录重建会话：首条为 system 时作为固定 system 消息，其余 system 记录忽略
fn restore(
    session_id: &str,
    records: Vec<Message>,
    max_history: usize,
) -> Result<SessionState, StoreError> {
    let mut state = SessionState::new(session_id);
    if let Some(conv) = records.iter().map(|m| m.conversation_id).find(|c| !c.is_nil()) {
        state.conversation_id = conv;
    }
    for (idx, msg) in records.into_iter().enumerate() {
        if msg.is_system() {
            if idx != 0 {
                tracing::warn!(session_id, sequence = msg.sequence, "skipping non-leading system record");
                continue;
            }
            // 固定记录不参与序号单调校验，只抬高计数器
            state.sequence_counter = state.sequence_counter.max(msg.sequence);
            state.system_message = Some(msg);
            continue;
        }
        state.apply(msg, max_history)?;
    }
    Ok(state)
}
