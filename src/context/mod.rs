//! 执行上下文层：具名结果表、只读 SQL 查询、有界预览、API 响应抽取

pub mod engine;
pub mod extract;
pub mod preview;
pub mod table;

pub use engine::{referenced_tables, ExecutionContext, SQL_RESULT_TABLE};
pub use extract::extract_rows;
pub use preview::{preview, Preview, PreviewBudget};
pub use table::{Row, Table, TableRef};
