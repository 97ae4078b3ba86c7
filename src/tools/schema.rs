//! 工具 schema 与参数校验
//!
//! schema 形如 `{name, description, parameters: {type: "object", properties, required}}`，
//! 注册时校验完整性；调用前按 required 与 properties.*.type 校验参数。
//! 可由 schemars 从参数结构体自动生成 parameters。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ToolError;

/// 工具 schema（同时用作发给后端的工具声明）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// 校验 schema 完整性，返回全部问题（空表示合法）
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("missing name".to_string());
        }
        if self.description.trim().is_empty() {
            errors.push("missing description".to_string());
        }
        match self.parameters.as_object() {
            None => errors.push("parameters must be an object".to_string()),
            Some(params) => {
                match params.get("type") {
                    Some(Value::String(t)) if t == "object" => {}
                    Some(_) => errors.push("parameters.type must be \"object\"".to_string()),
                    None => errors.push("parameters.type is missing".to_string()),
                }
                match params.get("properties") {
                    Some(Value::Object(_)) => {}
                    Some(_) => errors.push("parameters.properties must be an object".to_string()),
                    None => errors.push("parameters.properties is missing".to_string()),
                }
                match params.get("required") {
                    Some(Value::Array(items)) => {
                        if items.iter().any(|i| !i.is_string()) {
                            errors.push("parameters.required must list strings".to_string());
                        }
                    }
                    Some(_) => errors.push("parameters.required must be an array".to_string()),
                    None => errors.push("parameters.required is missing".to_string()),
                }
            }
        }
        errors
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        self.parameters.get("properties").and_then(Value::as_object)
    }

    fn required(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }

    /// 校验调用参数：必填字段齐全，已声明类型的字段类型匹配。
    /// 未知或非字符串的 type 不做约束；未声明的额外字段放行
    pub fn validate_arguments(&self, args: &Value) -> Result<(), ToolError> {
        let Some(obj) = args.as_object() else {
            return Err(ToolError::mismatch(format!(
                "arguments for '{}' must be an object",
                self.name
            )));
        };

        let missing: Vec<&str> = self.required().filter(|r| !obj.contains_key(*r)).collect();
        if !missing.is_empty() {
            return Err(ToolError::mismatch(format!(
                "missing required argument(s) for '{}': {}",
                self.name,
                missing.join(", ")
            )));
        }

        if let Some(props) = self.properties() {
            for (key, value) in obj {
                let Some(expected) = props.get(key).and_then(|p| p.get("type")).and_then(Value::as_str)
                else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(ToolError::mismatch(format!(
                        "argument '{key}' for '{}' should be of type {expected}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// 由参数结构体生成 parameters（去掉 `$schema` / `title`，保证存在 required）
pub fn parameters_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| Value::Object(Map::new()));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("type").or_insert_with(|| Value::String("object".into()));
        obj.entry("properties").or_insert_with(|| Value::Object(Map::new()));
        obj.entry("required").or_insert_with(|| Value::Array(Vec::new()));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> ToolSchema {
        ToolSchema::new(
            "place_order",
            "Place an order",
            json!({
                "type": "object",
                "properties": {
                    "size": {"type": "string"},
                    "quantity": {"type": "integer"},
                    "notes": {"type": ["string", "null"]},
                    "extra": {"type": "whatever"}
                },
                "required": ["size", "quantity"]
            }),
        )
    }

    #[test]
    fn test_validate_schema_reports_all_problems() {
        let s = ToolSchema::new("", "", json!({"type": "object"}));
        let errors = s.validate();
        assert_eq!(errors.len(), 4);
        assert!(order_schema().validate().is_empty());
    }

    #[test]
    fn test_parameters_must_be_object_typed() {
        let mut params = order_schema().parameters;
        params["type"] = json!("string");
        let errors = ToolSchema::new("place_order", "Place an order", params.clone()).validate();
        assert_eq!(errors, vec!["parameters.type must be \"object\"".to_string()]);

        params.as_object_mut().unwrap().remove("type");
        let errors = ToolSchema::new("place_order", "Place an order", params).validate();
        assert_eq!(errors, vec!["parameters.type is missing".to_string()]);
    }

    #[test]
    fn test_missing_required_argument() {
        let err = order_schema()
            .validate_arguments(&json!({"size": "Large"}))
            .unwrap_err();
        assert_eq!(err.kind, crate::core::ToolErrorKind::ArgumentMismatch);
        assert!(err.message.contains("quantity"));
    }

    #[test]
    fn test_type_checks() {
        let s = order_schema();
        assert!(s
            .validate_arguments(&json!({"size": "L", "quantity": 2}))
            .is_ok());
        assert!(s
            .validate_arguments(&json!({"size": "L", "quantity": "2"}))
            .is_err());
        assert!(s
            .validate_arguments(&json!({"size": "L", "quantity": 2.5}))
            .is_err());
        // 非字符串 type 与未知 type 不约束；未声明字段放行
        assert!(s
            .validate_arguments(&json!({"size": "L", "quantity": 1, "notes": 5, "extra": [], "other": true}))
            .is_ok());
    }

    #[test]
    fn test_parameters_for_struct() {
        #[allow(dead_code)]
        #[derive(JsonSchema)]
        struct Args {
            query: String,
            limit: Option<i64>,
        }
        let params = parameters_for::<Args>();
        assert_eq!(params["type"], "object");
        assert_eq!(params["required"], json!(["query"]));
        assert!(params.get("$schema").is_none());
        assert!(ToolSchema::new("q", "query", params).validate().is_empty());
    }
}
