//! Trace 模型：一次推理会话「实际发生了什么」
//!
//! 有序的 API 调用与查询步骤、原始问题、API 身份与 schema 指纹；捕获后不可变。
//! RunOutput 由 Trace + 执行上下文构造，实时推理与缓存回放共用同一构造函数，输出结构一致。

pub mod recorder;
pub mod step;

use serde::{Deserialize, Serialize};

use crate::api::{ApiIdentity, CacheKey, SchemaFingerprint};
use crate::context::{ExecutionContext, Preview, Table};

pub use recorder::TraceRecorder;
pub use step::{ApiCallStep, ApiRequest, Protocol, QueryStep, Step};

/// 已完成的推理会话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    question: String,
    api: ApiIdentity,
    schema_fingerprint: SchemaFingerprint,
    steps: Vec<Step>,
}

impl Trace {
    pub fn new(question: impl Into<String>, cache_key: CacheKey, steps: Vec<Step>) -> Self {
        Self {
            question: question.into(),
            api: cache_key.api,
            schema_fingerprint: cache_key.fingerprint,
            steps,
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn api(&self) -> &ApiIdentity {
        &self.api
    }

    pub fn schema_fingerprint(&self) -> &SchemaFingerprint {
        &self.schema_fingerprint
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.api.clone(), self.schema_fingerprint.clone())
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn api_call_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::ApiCall(_)))
            .count()
    }

    pub fn query_count(&self) -> usize {
        self.steps.len() - self.api_call_count()
    }
}

/// 一次回答的输出（实时与回放同形）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutput {
    pub ok: bool,
    /// 最后一步的完整输出表
    pub result: Option<Table>,
    /// 按上下文预算截断的预览
    pub preview: Option<Preview>,
    pub api_calls: Vec<ApiRequest>,
    pub queries: Vec<String>,
}

impl RunOutput {
    /// 由 Trace 与其执行上下文构造输出；最后一步的 output 表即结果
    pub fn from_trace(trace: &Trace, ctx: &ExecutionContext) -> Self {
        let mut api_calls = Vec::new();
        let mut queries = Vec::new();
        for step in trace.steps() {
            match step {
                Step::ApiCall(s) => api_calls.push(s.request.clone()),
                Step::Query(s) => queries.push(s.sql.clone()),
            }
        }
        let result = trace
            .steps()
            .last()
            .and_then(|s| ctx.table(s.output()).ok())
            .cloned();
        let preview = result.as_ref().map(|t| ctx.preview_default(t));
        Self {
            ok: true,
            result,
            preview,
            api_calls,
            queries,
        }
    }

    /// 结果行数（无结果时为 0）
    pub fn row_count(&self) -> usize {
        self.result.as_ref().map(Table::len).unwrap_or(0)
    }
}
