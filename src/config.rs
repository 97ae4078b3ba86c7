//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=ollama`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub index: IndexSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、system prompt、数据根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 内联 system prompt，优先于 system_prompt_file
    pub system_prompt: Option<String>,
    pub system_prompt_file: Option<PathBuf>,
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt: None,
            system_prompt_file: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl AppSection {
    /// 内联 prompt > prompt 文件 > 内置默认
    pub fn resolve_system_prompt(&self) -> String {
        if let Some(p) = self.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            return p.clone();
        }
        if let Some(path) = &self.system_prompt_file {
            match std::fs::read_to_string(path) {
                Ok(s) if !s.trim().is_empty() => return s,
                Ok(_) => tracing::warn!("system prompt file {} is empty", path.display()),
                Err(e) => tracing::warn!("Failed to read system prompt {}: {}", path.display(), e),
            }
        }
        DEFAULT_SYSTEM_PROMPT.to_string()
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful pizza restaurant assistant. \
Use query_documents to look up reviews and past orders, query_memory to recall earlier parts \
of this conversation, and place_order once the customer has confirmed pizza type, size, \
quantity and delivery address.";

/// [session] 段：历史窗口与持久化目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 每个会话保留的非 system 消息条数
    pub max_history: usize,
    pub history_dir: PathBuf,
    /// false 时会话只存在于内存
    pub persist: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_history: 15,
            history_dir: PathBuf::from("data/history"),
            persist: true,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai | ollama | mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "llama3.2".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次生成请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: "mxbai-embed-large".to_string(),
            base_url: None,
        }
    }
}

/// [index] 段：索引目录、文档源、检索条数、分块参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    pub db_dir: PathBuf,
    /// 文档分区数据源（glob 模式）
    pub sources: Vec<String>,
    pub top_k: usize,
    /// true 时 query_memory 检索所有会话的共享记忆分区
    pub shared_memory: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("data/db"),
            sources: vec![
                "data/reviews/*.csv".to_string(),
                "data/reviews/orders.jsonl".to_string(),
            ],
            top_k: 3,
            shared_memory: false,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// [tools] 段：工具超时、订单文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub order_file: PathBuf,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            order_file: PathBuf::from("data/reviews/orders.jsonl"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        } else {
            tracing::warn!("config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 加载失败时退回默认配置
pub fn load_or_default(config_path: Option<&Path>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.max_history, 15);
        assert_eq!(cfg.index.top_k, 3);
        assert_eq!(cfg.llm.timeouts.request, 60);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert!(!cfg.index.shared_memory);
    }

    #[test]
    fn test_explicit_file_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[session]\nmax_history = 4\n\n[llm]\nprovider = \"mock\"\n\n[index]\nshared_memory = true\n",
        )
        .unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.session.max_history, 4);
        assert_eq!(cfg.llm.provider, "mock");
        assert!(cfg.index.shared_memory);
        // 未出现的键保持默认
        assert_eq!(cfg.session.history_dir, PathBuf::from("data/history"));
    }

    #[test]
    fn test_system_prompt_resolution() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("system.txt");
        std::fs::write(&file, "From file").unwrap();

        let mut app = AppSection {
            system_prompt_file: Some(file),
            ..AppSection::default()
        };
        assert_eq!(app.resolve_system_prompt(), "From file");
        app.system_prompt = Some("Inline".into());
        assert_eq!(app.resolve_system_prompt(), "Inline");
        app.system_prompt = None;
        app.system_prompt_file = Some(dir.path().join("missing.txt"));
        assert_eq!(app.resolve_system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }
}
