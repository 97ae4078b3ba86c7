//! 工具调用参数解析：结构化对象直接使用，字符串严格按 JSON 解析，结果必须是对象

use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::memory::RawArguments;

/// 解析为 JSON 对象；空字符串与 null 视为无参数
pub fn resolve_arguments(raw: &RawArguments) -> Result<Value, ToolError> {
    let value = match raw {
        RawArguments::Structured(v) => v.clone(),
        RawArguments::Text(s) if s.trim().is_empty() => Value::Object(Map::new()),
        RawArguments::Text(s) => serde_json::from_str(s)
            .map_err(|e| ToolError::malformed(format!("Invalid JSON arguments: {e}")))?,
    };
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(ToolError::malformed(format!(
            "Arguments must be a JSON object, got: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolErrorKind;
    use serde_json::json;

    #[test]
    fn test_string_and_object_forms() {
        let text = RawArguments::Text(r#"{"size": "Large"}"#.into());
        assert_eq!(resolve_arguments(&text).unwrap(), json!({"size": "Large"}));
        let obj = RawArguments::Structured(json!({"size": "Large"}));
        assert_eq!(resolve_arguments(&obj).unwrap(), json!({"size": "Large"}));
        assert_eq!(
            resolve_arguments(&RawArguments::Text("  ".into())).unwrap(),
            json!({})
        );
    }

    #[test]
    fn test_malformed() {
        let err = resolve_arguments(&RawArguments::Text("{not valid json".into())).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::MalformedArguments);
        assert!(err.message.starts_with("Invalid JSON arguments"));

        let err = resolve_arguments(&RawArguments::Text("[1, 2]".into())).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::MalformedArguments);
        let err = resolve_arguments(&RawArguments::Structured(json!("text"))).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::MalformedArguments);
    }
}
