//! API 响应 -> 表行
//!
//! 顶层数组直接成行；对象若（去掉 GraphQL `data` 外壳后）恰有一个数组字段则取该数组；
//! 连接结构 `edges[].node` / `nodes` 自动展开；其他对象作为单行；标量包装为 `{"value": x}`。

use serde_json::{Map, Value};

use super::table::Row;

/// 从 API 响应中抽取表行
pub fn extract_rows(data: &Value) -> Vec<Row> {
    match data {
        Value::Array(items) => items.iter().map(to_row).collect(),
        Value::Object(map) => {
            if let Some(inner) = map.get("data").filter(|_| map.len() == 1) {
                return extract_rows(inner);
            }
            if let Some(items) = unwrap_connection(map) {
                return items.iter().map(to_row).collect();
            }
            match map.values().next() {
                Some(only) if map.len() == 1 && is_listish(only) => extract_rows(only),
                _ => vec![map.clone()],
            }
        }
        Value::Null => Vec::new(),
        scalar => vec![wrap_scalar(scalar)],
    }
}

fn is_listish(v: &Value) -> bool {
    match v {
        Value::Array(_) => true,
        Value::Object(m) => unwrap_connection(m).is_some(),
        _ => false,
    }
}

/// GraphQL 连接：{"edges": [{"node": {...}}]} 或 {"nodes": [...]}
fn unwrap_connection(map: &Map<String, Value>) -> Option<Vec<Value>> {
    if let Some(Value::Array(edges)) = map.get("edges") {
        let nodes = edges
            .iter()
            .map(|e| e.get("node").cloned().unwrap_or_else(|| e.clone()))
            .collect();
        return Some(nodes);
    }
    if let Some(Value::Array(nodes)) = map.get("nodes") {
        return Some(nodes.clone());
    }
    None
}

fn to_row(v: &Value) -> Row {
    match v {
        Value::Object(map) => map.clone(),
        other => wrap_scalar(other),
    }
}

fn wrap_scalar(v: &Value) -> Row {
    let mut row = Map::new();
    row.insert("value".to_string(), v.clone());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_array() {
        let rows = extract_rows(&json!([{"id": 1}, {"id": 2}]));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_graphql_single_list_field() {
        let rows = extract_rows(&json!({"data": {"users": [{"id": 1}, {"id": 2}, {"id": 3}]}}));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get("id"), Some(&json!(3)));
    }

    #[test]
    fn test_connection_edges_unwrapped() {
        let rows = extract_rows(&json!({"users": {"edges": [{"node": {"id": "a"}}, {"node": {"id": "b"}}]}}));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!("a")));
    }

    #[test]
    fn test_plain_object_is_single_row() {
        let rows = extract_rows(&json!({"id": 7, "tags": ["x"], "name": "n"}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&json!("n")));
    }

    #[test]
    fn test_scalars_wrapped() {
        let rows = extract_rows(&json!([1, "two"]));
        assert_eq!(rows[1].get("value"), Some(&json!("two")));
    }
}
