//! 错误类型
//!
//! 按关注点拆分：执行上下文（ContextError）、目标 API（ApiError）、推理引擎（LlmError）、
//! 学习（LearnError，总是被吞掉只记日志）、回放（ReplayError，决定是否回退到实时推理）。

use thiserror::Error;

/// 执行上下文错误：表注册或查询失败，失败时已有表保持不变
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    /// SQL 引擎给出的诊断信息
    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Only read-only queries are allowed")]
    NotReadOnly,
}

impl From<rusqlite::Error> for ContextError {
    fn from(e: rusqlite::Error) -> Self {
        ContextError::QueryError(e.to_string())
    }
}

/// 目标 API（GraphQL / REST）调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    /// 非 2xx 响应，body 已截断
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("{0} method not allowed (read-only mode)")]
    MethodNotAllowed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// 推理引擎（LLM）错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM timeout")]
    Timeout,

    #[error("Empty LLM response")]
    EmptyResponse,
}

/// Recipe 学习失败；调用方只记录日志，不影响实时答案
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LearnError {
    /// 推理引擎没有给出可用模板
    #[error("Generalization failed: {0}")]
    GeneralizationFailure(String),

    /// 用默认参数渲染的模板与原始 Trace 不一致
    #[error("Validation failed at step {step:?}: {reason}")]
    ValidationFailure { step: Option<usize>, reason: String },

    #[error("Recipe learning disabled")]
    Disabled,

    #[error("Trace not learnable: {0}")]
    Skipped(String),

    #[error("Learning cancelled")]
    Cancelled,
}

impl LearnError {
    pub(crate) fn validation(step: Option<usize>, reason: impl Into<String>) -> Self {
        LearnError::ValidationFailure {
            step,
            reason: reason.into(),
        }
    }
}

/// 回放某一步失败的底层原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepFailure {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Query(#[from] ContextError),

    /// 模板渲染失败（引用了未声明的参数）
    #[error("Template render failed: {0}")]
    Render(String),
}

/// Recipe 回放错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// 调用方传入未知参数名或类型不符；不执行任何步骤
    #[error("Bad parameter: {0}")]
    BadParameterError(String),

    /// 第 step 步（从 1 开始）执行失败，其余步骤中止，临时表全部丢弃
    #[error("Replay failed at step {step}: {cause}")]
    ReplayExecutionError { step: usize, cause: StepFailure },

    /// 匹配与回放之间 recipe 已被淘汰，按未命中处理
    #[error("Recipe evicted: {0}")]
    EvictionRace(String),

    /// recipe 不属于当前 API / schema 指纹
    #[error("Recipe does not match current API or schema")]
    SchemaMismatch,

    #[error("Replay cancelled")]
    Cancelled,
}

/// 回答一个问题的硬错误（回退到实时推理之后仍失败，或调用方误用）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnswerError {
    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("Live reasoning failed: {0}")]
    Live(#[from] LlmError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Answer cancelled")]
    Cancelled,
}

impl ReplayError {
    /// 外层是否应回退到实时推理（只有调用方误用才算硬错误）
    pub fn is_fallback(&self) -> bool {
        !matches!(self, ReplayError::BadParameterError(_))
    }

    /// 失败步骤编号（从 1 开始），仅执行错误有
    pub fn failed_step(&self) -> Option<usize> {
        match self {
            ReplayError::ReplayExecutionError { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bad_parameter_is_hard_error() {
        assert!(!ReplayError::BadParameterError("x".into()).is_fallback());
        assert!(ReplayError::EvictionRace("r_1".into()).is_fallback());
        assert!(ReplayError::SchemaMismatch.is_fallback());
        let exec = ReplayError::ReplayExecutionError {
            step: 2,
            cause: StepFailure::Api(ApiError::Status {
                status: 500,
                body: "boom".into(),
            }),
        };
        assert!(exec.is_fallback());
        assert_eq!(exec.failed_step(), Some(2));
        assert_eq!(exec.to_string(), "Replay failed at step 2: HTTP 500: boom");
    }
}
