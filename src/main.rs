//! Hive - Rust 工具调用对话智能体编排器
//!
//! 入口：初始化日志与 Agent，从 stdin 逐行读取用户输入，每个 turn 事件以一行 JSON 写到 stdout。
//! 用法：`hive [session_id]`，省略时新建会话；session_id 只能含字母数字、`-`、`_`。输入 `exit` 结束会话。

use anyhow::Context;
use hive::memory::validate_session_id;
use hive::{config, observability, Agent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = config::load_or_default(None);
    let agent = Agent::from_config(&cfg).context("Failed to create agent")?;
    agent.warm_up().await;

    let session_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    validate_session_id(&session_id).context("session id must be a plain file name")?;
    tracing::info!(session_id = %session_id, "session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case("exit") {
            break;
        }

        let mut turn = agent.run_turn(session_id.clone(), text, None);
        while let Some(event) = turn.recv().await {
            stdout.write_all(event.to_json_line().as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    agent
        .end_session(&session_id)
        .await
        .context("Failed to end session")?;
    Ok(())
}
