//! 索引数据源解析
//!
//! 文档分区：csv（每行一条，`列: 值` 拼接）、json（数组每项一条）、jsonl（每行一条）、txt/md（分块）。
//! 记忆分区：会话 JSONL 历史，跳过 system 记录，嵌套 JSON 的 content 取内层文本。
//! 每条 Passage 带稳定 id（`<文件名>:<序号>`）与 document_type 元数据。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::core::IndexError;
use crate::memory::persistence::SessionFile;
use crate::memory::rag::{Chunker, Passage};
use crate::memory::Role;

/// 展开 glob 模式，结果排序去重；不含通配符的路径原样保留（即使不存在）
pub fn expand_sources(patterns: &[String]) -> Vec<PathBuf> {
    let mut out = BTreeSet::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            out.insert(PathBuf::from(pattern));
            continue;
        }
        match glob::glob(pattern) {
            Ok(paths) => {
                for entry in paths.flatten() {
                    out.insert(entry);
                }
            }
            Err(e) => tracing::warn!(pattern = %pattern, "invalid source pattern: {}", e),
        }
    }
    out.into_iter().collect()
}

/// 会话历史目录下全部 `*.jsonl`（排序）
pub fn history_files(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*.jsonl");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    match glob::glob(pattern) {
        Ok(paths) => {
            let mut files: Vec<PathBuf> = paths.flatten().collect();
            files.sort();
            files
        }
        Err(_) => Vec::new(),
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("source")
        .to_string()
}

/// 按文件名推断文档类型
pub fn document_type(path: &Path) -> &'static str {
    let name = stem(path).to_lowercase();
    if name.contains("review") {
        "review"
    } else if name.contains("order") {
        "order"
    } else if name.contains("history") || name.contains("conversation") {
        "memory"
    } else {
        "document"
    }
}

/// 解析文档源；不支持的扩展名与缺失文件跳过，坏文件返回错误
pub async fn parse_documents(paths: &[PathBuf], chunker: &Chunker) -> Result<Vec<Passage>, IndexError> {
    let mut passages = Vec::new();
    for path in paths {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "source file not found, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        passages.extend(parse_content(path, &content, chunker)?);
    }
    Ok(passages)
}

/// 按扩展名解析单个文件内容
pub fn parse_content(path: &Path, content: &str, chunker: &Chunker) -> Result<Vec<Passage>, IndexError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let passages = match ext.as_str() {
        "csv" => parse_csv(path, content)?,
        "json" => parse_json(path, content)?,
        "jsonl" => parse_jsonl(path, content),
        "txt" | "md" | "markdown" => chunker.chunk(&stem(path), content),
        _ => {
            tracing::warn!(path = %path.display(), "unsupported source type, skipping");
            Vec::new()
        }
    };
    let source = path.display().to_string();
    let doc_type = document_type(path);
    Ok(passages
        .into_iter()
        .map(|p| {
            p.with_metadata("source", source.clone())
                .with_metadata("document_type", doc_type)
        })
        .collect())
}

/// 首行为表头；引号、转义与字段内换行交给 csv crate
fn parse_csv(path: &Path, content: &str) -> Result<Vec<Passage>, IndexError> {
    let parse_err = |e: csv::Error| IndexError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());
    let header = reader.headers().map_err(parse_err)?.clone();
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let name = stem(path);
    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let fields = record.map_err(parse_err)?;
        if fields.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if fields.len() > header.len() {
            return Err(IndexError::Parse {
                path: path.display().to_string(),
                reason: format!("row {} has {} fields, header has {}", row + 1, fields.len(), header.len()),
            });
        }
        let text = header
            .iter()
            .zip(fields.iter())
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| format!("{}: {}", k.trim(), v.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        out.push(Passage::new(format!("{name}:{row}"), text).with_metadata("row", row as u64));
    }
    Ok(out)
}

fn json_text(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `[` 开头按数组解析，否则按行解析
fn parse_json(path: &Path, content: &str) -> Result<Vec<Passage>, IndexError> {
    if !content.trim_start().starts_with('[') {
        return Ok(parse_jsonl(path, content));
    }
    let value: Value = serde_json::from_str(content).map_err(|e| IndexError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let name = stem(path);
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items
        .iter()
        .enumerate()
        .map(|(i, item)| Passage::new(format!("{name}:{i}"), json_text(item)).with_metadata("index", i as u64))
        .collect())
}

fn parse_jsonl(path: &Path, content: &str) -> Vec<Passage> {
    let name = stem(path);
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .filter_map(|(i, line)| match serde_json::from_str::<Value>(line) {
            Ok(item) => Some(Passage::new(format!("{name}:{i}"), json_text(&item)).with_metadata("line", i as u64)),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = i, "skipping malformed jsonl line: {}", e);
                None
            }
        })
        .collect()
}

/// 工具结果常以 JSON 字符串存入 content；若内层是带 content 字段的对象则取内层
fn unwrap_content(content: &str) -> String {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(obj)) => match obj.get("content") {
            Some(Value::String(inner)) => inner.clone(),
            Some(other) => other.to_string(),
            None => content.to_string(),
        },
        _ => content.to_string(),
    }
}

/// 解析会话历史文件为记忆 Passage；session_id 取文件名
pub async fn parse_memory(paths: &[PathBuf]) -> Result<Vec<Passage>, IndexError> {
    let mut out = Vec::new();
    for path in paths {
        let session_id = stem(path);
        let records = SessionFile::new(path).load().await.map_err(|e| IndexError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        for msg in records {
            if msg.role == Role::System {
                continue;
            }
            let Some(content) = msg.content.as_deref().filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            let text = format!("{}: {}", msg.role.as_str(), unwrap_content(content));
            out.push(
                Passage::new(format!("{}:{}", session_id, msg.sequence), text)
                    .with_metadata("session_id", session_id.clone())
                    .with_metadata("role", msg.role.as_str())
                    .with_metadata("document_type", "memory")
                    .with_metadata("timestamp", msg.timestamp.to_rfc3339())
                    .with_metadata("sequence", msg.sequence),
            );
        }
    }
    Ok(out)
}
