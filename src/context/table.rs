//! 表：执行上下文中的具名结果集

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一行数据（列名 -> JSON 值）
pub type Row = Map<String, Value>;

/// 具名的内存结果集，列顺序为首次出现顺序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    /// 由行构造表，列取所有行键的并集（保持首次出现顺序）
    pub fn from_rows(name: impl Into<String>, rows: Vec<Row>) -> Self {
        let columns = collect_columns(&rows);
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_ref(&self) -> TableRef {
        TableRef {
            name: self.name.clone(),
            columns: self.columns.clone(),
            row_count: self.rows.len(),
        }
    }

    /// 行转成 JSON 数组（最终结果输出用）
    pub fn rows_json(&self) -> Value {
        Value::Array(self.rows.iter().cloned().map(Value::Object).collect())
    }
}

/// 表的轻量引用：名称、列、行数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub columns: Vec<String>,
    pub row_count: usize,
}

pub(crate) fn collect_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columns_are_union_in_first_seen_order() {
        let table = Table::from_rows(
            "users",
            vec![row(json!({"id": 1, "name": "a"})), row(json!({"id": 2, "age": 30}))],
        );
        assert_eq!(table.columns, vec!["id", "name", "age"]);
        assert_eq!(table.to_ref().row_count, 2);
    }
}
