//! 会话持久化
//!
//! 每个会话一个 JSONL 文件（一行一条规范化 Message，按插入顺序），首行可以是 role=system 记录。
//! 正常运行时逐条追加；`write_all` 用于整体快照（save / batch_load 结束时）。
//! 文件名直接取 session_id，因此 id 先经 [`validate_session_id`] 校验。

use std::path::{Path, PathBuf};

use std::io::SeekFrom;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::core::StoreError;
use crate::memory::canonical::to_canonical;
use crate::memory::Message;

const MAX_SESSION_ID_LEN: usize = 128;

/// session_id 会成为文件名：只允许 ASCII 字母数字、`-`、`_`
pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    let ok = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

/// 单会话 JSONL 文件
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<dir>/<session_id>.jsonl`；非法 id 返回 InvalidSessionId
    pub fn for_session(dir: &Path, session_id: &str) -> Result<Self, StoreError> {
        validate_session_id(session_id)?;
        Ok(Self::new(dir.join(format!("{session_id}.jsonl"))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部记录；文件不存在时返回空 Vec。空行跳过，坏行（如崩溃留下的半行）告警后跳过
    pub async fn load(&self) -> Result<Vec<Message>, StoreError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(m) => messages.push(m),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    "skipping malformed session record: {}",
                    e
                ),
            }
        }
        Ok(messages)
    }

    /// 追加一条记录；父目录不存在时自动创建。末尾是半行时先补换行，新记录另起一行
    pub async fn append(&self, message: &Message) -> Result<(), StoreError> {
        self.ensure_parent().await?;
        let mut line = encode_line(message)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        let len = file.metadata().await?.len();
        if len > 0 {
            file.seek(SeekFrom::Start(len - 1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.insert(0, '\n');
            }
        }
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 整体重写（system 记录在前）
    pub async fn write_all(&self, messages: &[Message]) -> Result<(), StoreError> {
        self.ensure_parent().await?;
        let mut buf = String::new();
        for msg in messages {
            buf.push_str(&encode_line(msg)?);
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, buf).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// 删除文件（不存在视为成功）
    pub async fn remove(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_parent(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

fn encode_line(message: &Message) -> Result<String, StoreError> {
    let value = to_canonical(message);
    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_then_load() {
        let dir = TempDir::new().unwrap();
        let file = SessionFile::for_session(dir.path(), "s1").unwrap();
        assert!(file.load().await.unwrap().is_empty());

        file.append(&Message::system("be brief").with_sequence(1))
            .await
            .unwrap();
        file.append(&Message::user("hello").with_sequence(2))
            .await
            .unwrap();

        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].is_system());
        assert_eq!(loaded[1].content_str(), "hello");
        assert_eq!(loaded[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_write_all_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let file = SessionFile::for_session(dir.path(), "s2").unwrap();
        file.append(&Message::user("old").with_sequence(1))
            .await
            .unwrap();
        file.write_all(&[Message::user("new").with_sequence(5)])
            .await
            .unwrap();
        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content_str(), "new");

        file.remove().await.unwrap();
        file.remove().await.unwrap();
        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_last_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let file = SessionFile::for_session(dir.path(), "s3").unwrap();
        file.append(&Message::user("one").with_sequence(1))
            .await
            .unwrap();
        file.append(&Message::assistant(Some("two".into())).with_sequence(2))
            .await
            .unwrap();
        let mut raw = std::fs::read_to_string(file.path()).unwrap();
        raw.push_str(r#"{"role":"user","cont"#);
        std::fs::write(file.path(), raw).unwrap();

        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].content_str(), "two");

        // 之后的追加不会与半行拼在一起
        file.append(&Message::user("three").with_sequence(3))
            .await
            .unwrap();
        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].content_str(), "three");
    }

    #[test]
    fn test_session_id_must_be_a_plain_file_name() {
        let dir = Path::new("data/history");
        assert!(SessionFile::for_session(dir, "s1").is_ok());
        assert!(SessionFile::for_session(dir, "6f1c2a4e-8d3b-4f7a-9c1e-2b5d7e9f0a13").is_ok());
        for bad in ["", "../x", "a/b", "a\\b", "..", ".hidden", "x y"] {
            assert!(
                matches!(
                    SessionFile::for_session(dir, bad),
                    Err(StoreError::InvalidSessionId(_))
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_session_id(&"a".repeat(129)).is_err());
    }
}
