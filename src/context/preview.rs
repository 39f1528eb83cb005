//! 表预览预算
//!
//! 字符预算与行数预算相互独立，取更严格者；只按整行截断，超出预算时附带「还有更多行」提示。

use serde::Serialize;
use serde_json::Value;

use super::table::{Row, Table};

/// 预览预算：字符数与行数上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewBudget {
    pub max_chars: usize,
    pub max_rows: usize,
}

impl PreviewBudget {
    pub fn new(max_chars: usize, max_rows: usize) -> Self {
        Self { max_chars, max_rows }
    }
}

impl Default for PreviewBudget {
    fn default() -> Self {
        Self::new(32_000, 10)
    }
}

/// 预览结果：完整行、总行数、是否截断与提示
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total_rows: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Preview {
    /// 序列化为推理引擎可读的 JSON
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// 每行按紧凑 JSON 计字符，行间分隔符计 1
fn row_chars(row: &Row) -> usize {
    serde_json::to_string(row)
        .map(|s| s.chars().count())
        .unwrap_or(usize::MAX)
}

/// 在两个预算内取尽可能多的整行
pub fn preview(table: &Table, max_chars: usize, max_rows: usize) -> Preview {
    let mut rows = Vec::new();
    let mut used_chars: usize = 2; // 外层 []

    for row in table.rows.iter().take(max_rows) {
        let cost = row_chars(row).saturating_add(usize::from(!rows.is_empty()));
        if used_chars.saturating_add(cost) > max_chars {
            break;
        }
        used_chars += cost;
        rows.push(row.clone());
    }

    let total_rows = table.rows.len();
    let truncated = rows.len() < total_rows;
    let hint = truncated.then(|| {
        format!(
            "Showing {} of {} rows from '{}'. More rows exist; use SQL with LIMIT/OFFSET or aggregation to inspect the rest.",
            rows.len(),
            total_rows,
            table.name
        )
    });

    Preview {
        table: table.name.clone(),
        columns: table.columns.clone(),
        rows,
        total_rows,
        truncated,
        hint,
    }
}
