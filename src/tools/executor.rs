//! 工具执行器
//!
//! 持有共享的 ToolRegistry 与全局超时，dispatch(tool_name, args, ctx) 依次解析、校验、执行，
//! 超时转为 ToolErrorKind::Timeout；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{ToolError, ToolErrorKind};
use crate::tools::{Tool, ToolContext, ToolRegistry, ToolSchema};

/// 工具执行器：对每次调用施加超时
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 执行指定工具；未知工具、参数不符、执行失败、超时都以 ToolError 返回
    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let start = Instant::now();
        let preview = args_preview(&args);

        let result = match timeout(self.timeout, self.registry.invoke(tool_name, args, ctx)).await {
            Ok(r) => r,
            Err(_) => Err(ToolError::new(
                ToolErrorKind::Timeout,
                format!(
                    "Tool '{}' timed out after {}s",
                    tool_name,
                    self.timeout.as_secs_f32()
                ),
            )),
        };

        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => serde_json::to_value(e.kind)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "error".to_string()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "session_id": ctx.session_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.registry.schemas()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register_fn(
            ToolSchema::new(
                "slow",
                "Sleeps for a while",
                json!({"type": "object", "properties": {}, "required": []}),
            ),
            |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("done"))
            },
        )
        .unwrap();
        reg.register_fn(
            ToolSchema::new(
                "fail",
                "Always fails",
                json!({"type": "object", "properties": {}, "required": []}),
            ),
            |_, _| async { Err(ToolError::runtime("boom")) },
        )
        .unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_kind() {
        let exec = ToolExecutor::new(registry(), 30).with_timeout(Duration::from_millis(20));
        let err = exec
            .dispatch("slow", json!({}), &ToolContext::new("s"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_runtime_and_unknown_errors_pass_through() {
        let exec = ToolExecutor::new(registry(), 30);
        let ctx = ToolContext::new("s");
        let err = exec.dispatch("fail", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err, ToolError::runtime("boom"));
        let err = exec.dispatch("nope", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnknownTool);
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
        assert_eq!(args_preview(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
