//! 执行上下文：每个会话 / 每次回放独占的一组具名表
//!
//! 底层为内存 SQLite：嵌套对象与数组以 JSON 文本入列，可用 `col ->> '$.a.b'` 或 `json_extract` 访问；
//! 同名建表为后写覆盖；查询只接受只读语句，失败不影响已有表。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};

use super::preview::{preview, Preview, PreviewBudget};
use super::table::{Row, Table, TableRef};
use crate::core::ContextError;

/// SQL 查询结果的默认表名
pub const SQL_RESULT_TABLE: &str = "sql_result";

static TABLE_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn table_name_re() -> &'static Regex {
    TABLE_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// 执行上下文（ECM）
pub struct ExecutionContext {
    conn: Connection,
    /// 注册时的原始行，保留布尔等 SQLite 无法还原的类型
    tables: HashMap<String, Table>,
    budget: PreviewBudget,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tables", &self.table_names())
            .field("budget", &self.budget)
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Result<Self, ContextError> {
        Self::with_budget(PreviewBudget::default())
    }

    pub fn with_budget(budget: PreviewBudget) -> Result<Self, ContextError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            tables: HashMap::new(),
            budget,
        })
    }

    pub fn budget(&self) -> PreviewBudget {
        self.budget
    }

    /// 注册表；同名表被整体替换。整个替换在一个事务内完成，失败时旧表保留
    pub fn create_table(&mut self, name: &str, rows: Vec<Row>) -> Result<TableRef, ContextError> {
        if !table_name_re().is_match(name) {
            return Err(ContextError::InvalidTableName(name.to_string()));
        }
        let table = Table::from_rows(name, rows);
        let columns = if table.columns.is_empty() {
            vec!["value".to_string()]
        } else {
            table.columns.clone()
        };

        let tx = self.conn.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
        let column_defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(c), column_affinity(&table.rows, c)))
            .collect();
        tx.execute(
            &format!("CREATE TABLE {} ({})", quote_ident(name), column_defs.join(", ")),
            [],
        )?;
        {
            let placeholders = vec!["?"; columns.len()].join(", ");
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(name),
                placeholders
            ))?;
            for row in &table.rows {
                let values = columns
                    .iter()
                    .map(|c| to_sql_value(row.get(c).unwrap_or(&Value::Null)));
                insert.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        let table_ref = table.to_ref();
        tracing::debug!(table = %name, rows = table_ref.row_count, "table registered");
        self.tables.insert(name.to_string(), table);
        Ok(table_ref)
    }

    /// 执行只读 SQL，返回结果表（名为 sql_result，不注册）
    pub fn run_query(&self, sql: &str) -> Result<Table, ContextError> {
        let mut stmt = self.conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(ContextError::NotReadOnly);
        }
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(sql_row) = cursor.next()? {
            let mut row = Row::new();
            for (i, col) in columns.iter().enumerate() {
                row.insert(col.clone(), from_sql_value(sql_row.get_ref(i)?));
            }
            rows.push(row);
        }
        Ok(Table {
            name: SQL_RESULT_TABLE.to_string(),
            columns,
            rows,
        })
    }

    /// 执行查询并把结果注册为 output 表；查询失败时不做任何注册
    pub fn query_into(&mut self, sql: &str, output: &str) -> Result<Table, ContextError> {
        let mut result = self.run_query(sql)?;
        result.name = output.to_string();
        self.create_table(output, result.rows.clone())?;
        if let Some(stored) = self.tables.get_mut(output) {
            // 保留 SELECT 的列顺序
            stored.columns = result.columns.clone();
        }
        Ok(result)
    }

    /// 读取已注册的表
    pub fn table(&self, name: &str) -> Result<&Table, ContextError> {
        self.tables
            .get(name)
            .ok_or_else(|| ContextError::UnknownTable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// 显式预算的预览
    pub fn preview(&self, table: &Table, max_chars: usize, max_rows: usize) -> Preview {
        preview(table, max_chars, max_rows)
    }

    /// 使用上下文默认预算的预览
    pub fn preview_default(&self, table: &Table) -> Preview {
        preview(table, self.budget.max_chars, self.budget.max_rows)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// 列类型推断：全整数 INTEGER，全数字 REAL，全布尔 INTEGER，其他 TEXT（混合类型不声明）
fn column_affinity(rows: &[Row], column: &str) -> &'static str {
    let mut kinds = rows
        .iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::Bool(_) => "INTEGER",
            Value::Number(n) if n.is_i64() => "INTEGER",
            Value::Number(_) => "REAL",
            _ => "TEXT",
        });
    let Some(first) = kinds.next() else {
        return "";
    };
    let mut affinity = first;
    for kind in kinds {
        affinity = match (affinity, kind) {
            (a, b) if a == b => a,
            ("INTEGER", "REAL") | ("REAL", "INTEGER") => "REAL",
            _ => return "",
        };
    }
    affinity
}

fn to_sql_value(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn from_sql_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                    return parsed;
                }
            }
            Value::String(text.into_owned())
        }
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// 给定 SQL 文本，找出其中引用到的已知表名（用于回放依赖分析）
pub fn referenced_tables(sql: &str, known: &[String]) -> Vec<String> {
    static IDENT_RE: OnceLock<Regex> = OnceLock::new();
    let re = IDENT_RE
        .get_or_init(|| Regex::new(r#""((?:[^"]|"")+)"|([A-Za-z_][A-Za-z0-9_]*)"#).expect("valid regex"));
    let mut found: Vec<String> = Vec::new();
    for cap in re.captures_iter(sql) {
        let ident = cap
            .get(1)
            .map(|m| m.as_str().replace("\"\"", "\""))
            .or_else(|| cap.get(2).map(|m| m.as_str().to_string()));
        if let Some(ident) = ident {
            if known.iter().any(|k| k == &ident) && !found.contains(&ident) {
                found.push(ident);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(v: Value) -> Vec<Row> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect()
    }

    fn users() -> Vec<Row> {
        rows(json!([
            {"id": 1, "name": "ann", "age": 31, "active": true, "address": {"city": "Oslo"}},
            {"id": 2, "name": "bob", "age": 25, "active": false, "address": {"city": "Rome"}},
            {"id": 3, "name": "cy", "age": 42, "active": true, "address": {"city": "Oslo"}}
        ]))
    }

    #[test]
    fn test_order_and_limit() {
        let mut ctx = ExecutionContext::new().unwrap();
        ctx.create_table("users", users()).unwrap();
        let t = ctx
            .run_query("SELECT name, age FROM users ORDER BY age DESC LIMIT 2")
            .unwrap();
        assert_eq!(t.columns, vec!["name", "age"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0].get("name"), Some(&json!("cy")));
    }

    #[test]
    fn test_nested_field_access_and_aggregation() {
        let mut ctx = ExecutionContext::new().unwrap();
        ctx.create_table("users", users()).unwrap();
        let t = ctx
            .run_query(
                "SELECT address ->> '$.city' AS city, COUNT(*) AS n FROM users GROUP BY city ORDER BY n DESC",
            )
            .unwrap();
        assert_eq!(t.rows[0].get("city"), Some(&json!("Oslo")));
        assert_eq!(t.rows[0].get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_join_across_tables() {
        let mut ctx = ExecutionContext::new().unwrap();
        ctx.create_table("users", users()).unwrap();
        ctx.create_table(
            "orders",
            rows(json!([{"user_id": 1, "total": 10.5}, {"user_id": 1, "total": 4.5}, {"user_id": 3, "total": 1.0}])),
        )
        .unwrap();
        let t = ctx
            .run_query(
                "SELECT u.name, SUM(o.total) AS spent FROM users u JOIN orders o ON o.user_id = u.id \
                 GROUP BY u.name ORDER BY spent DESC",
            )
            .unwrap();
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0].get("spent"), Some(&json!(15.0)));
    }

    #[test]
    fn test_same_name_replaces_table() {
        let mut ctx = ExecutionContext::new().unwrap();
        ctx.create_table("data", users()).unwrap();
        ctx.create_table("data", rows(json!([{"x": 1}]))).unwrap();
        let t = ctx.run_query("SELECT * FROM data").unwrap();
        assert_eq!(t.columns, vec!["x"]);
        assert_eq!(ctx.table("data").unwrap().rows.len(), 1);
    }

    #[test]
    fn test_query_error_leaves_tables_untouched() {
        let mut ctx = ExecutionContext::new().unwrap();
        ctx.create_table("users", users()).unwrap();
        let err = ctx.query_into("SELEC nope FROM users", "users").unwrap_err();
        assert!(matches!(err, ContextError::QueryError(_)));
        assert_eq!(ctx.table("users").unwrap().rows.len(), 3);
        let t = ctx.run_query("SELECT COUNT(*) AS n FROM users").unwrap();
        assert_eq!(t.rows[0].get("n"), Some(&json!(3)));
    }

    #[test]
    fn test_write_statements_rejected() {
        let mut ctx = ExecutionContext::new().unwrap();
        ctx.create_table("users", users()).unwrap();
        assert_eq!(
            ctx.run_query("DELETE FROM users").unwrap_err(),
            ContextError::NotReadOnly
        );
        assert_eq!(ctx.table("users").unwrap().rows.len(), 3);
    }

    #[test]
    fn test_invalid_table_name() {
        let mut ctx = ExecutionContext::new().unwrap();
        let err = ctx.create_table("users; DROP", users()).unwrap_err();
        assert!(matches!(err, ContextError::InvalidTableName(_)));
    }

    #[test]
    fn test_referenced_tables() {
        let known = vec!["users".to_string(), "orders".to_string(), "posts".to_string()];
        let found = referenced_tables(
            "SELECT * FROM users u JOIN \"orders\" o ON o.user_id = u.id",
            &known,
        );
        assert_eq!(found, vec!["users", "orders"]);
    }
}
