//! 规范化边界
//!
//! 所有进入持久化或指纹计算的值都经过 `to_canonical`：对象键按字典序排列，
//! 保证同一逻辑值只有一种序列化形式；无法表示为 JSON 的值压平为字符串。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// 将任意可序列化值转为规范化 JSON 值；无法序列化的值压平为其 Debug 字符串
pub fn to_canonical<T: Serialize + std::fmt::Debug>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => canonicalize(v),
        Err(_) => Value::String(format!("{value:?}")),
    }
}

/// 递归排序对象键
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// 规范化后的紧凑 JSON 文本
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value.clone()).to_string()
}

/// 工具返回值写入消息时的文本形式：字符串原样保留，其余为规范化 JSON
pub fn canonical_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => canonical_string(other),
    }
}

/// 工具调用指纹：函数名 + 规范化参数，用于统计重复调用
pub fn fingerprint(function_name: &str, args: &Value) -> String {
    format!("{}:{}", function_name, canonical_string(args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 1, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":{"x":1,"y":2},"b":1}"#);
    }

    #[test]
    fn test_fingerprint_distinguishes_args() {
        let f1 = fingerprint("place_order", &json!({"a": 1}));
        let f2 = fingerprint("place_order", &json!({"a": 2}));
        assert_ne!(f1, f2);
        assert_eq!(f1, "place_order:{\"a\":1}");
    }

    #[test]
    fn test_canonical_content_keeps_strings() {
        assert_eq!(canonical_content(&json!("plain")), "plain");
        assert_eq!(canonical_content(&json!({"k": [1, 2]})), r#"{"k":[1,2]}"#);
    }

    #[test]
    fn test_to_canonical_of_struct() {
        #[derive(Serialize, Debug)]
        struct Order {
            size: String,
            quantity: u32,
        }
        let v = to_canonical(&Order {
            size: "Large".into(),
            quantity: 2,
        });
        assert_eq!(v, json!({"quantity": 2, "size": "Large"}));
    }
}
