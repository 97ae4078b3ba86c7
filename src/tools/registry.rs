//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / invoke），由 ToolRegistry 按名注册与解析。
//! 注册时拒绝重名与不完整 schema；启动完成后以 Arc 共享，只读。

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{RegistryError, ToolError};
use crate::tools::ToolSchema;

/// 调用上下文：工具据此区分会话（如按会话过滤的历史检索）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub session_id: String,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

/// 工具 trait：名称、描述（供后端理解）、参数 schema、异步执行（args 为已解析的 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(self.name(), self.description(), self.parameters_schema())
    }

    /// 执行；返回值为字符串时原样写入会话，否则写入规范化 JSON
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

type BoxedHandler =
    Box<dyn Fn(Value, ToolContext) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>> + Send + Sync>;

/// 以闭包实现的工具
pub struct FnTool {
    schema: ToolSchema,
    handler: BoxedHandler,
}

impl FnTool {
    pub fn new<F, Fut>(schema: ToolSchema, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            schema,
            handler: Box::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn description(&self) -> &str {
        &self.schema.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.parameters.clone()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        (self.handler)(args, ctx.clone()).await
    }
}

/// 工具注册表：按名称有序存储，schemas() 顺序稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let schema = tool.schema();
        let errors = schema.validate();
        if !errors.is_empty() {
            return Err(RegistryError::InvalidSchema {
                name: schema.name,
                errors,
            });
        }
        if self.tools.contains_key(&schema.name) {
            return Err(RegistryError::Duplicate(schema.name));
        }
        tracing::debug!(tool = %schema.name, "tool registered");
        self.tools.insert(schema.name, tool);
        Ok(())
    }

    /// 以 schema + 闭包注册
    pub fn register_fn<F, Fut>(&mut self, schema: ToolSchema, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register(FnTool::new(schema, handler))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 按名解析；不存在时返回 UnknownTool
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.get(name).ok_or_else(|| ToolError::unknown(name))
    }

    /// 解析 → 参数校验 → 执行（无超时，超时由 ToolExecutor 施加）
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self.resolve(name)?;
        tool.schema().validate_arguments(&args)?;
        tool.invoke(args, ctx).await
    }

    /// 全部工具 schema，发给后端
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
