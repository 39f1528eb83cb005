//! Trace 录制器：实时推理循环每完成一个成功步骤就记录一次
//!
//! 失败的调用不记录；使用了轮询等不可回放手段时标记为不可学习。

use crate::api::CacheKey;

use super::step::{ApiRequest, Step};
use super::Trace;

#[derive(Debug, Default)]
pub struct TraceRecorder {
    steps: Vec<Step>,
    unreplayable: Option<String>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_api_call(&mut self, request: ApiRequest, output: impl Into<String>) {
        self.steps.push(Step::api_call(request, output));
    }

    pub fn record_query(&mut self, sql: impl Into<String>, output: impl Into<String>) {
        self.steps.push(Step::query(sql, output));
    }

    /// 标记本次会话不可回放（如使用了轮询），之后不会学习 recipe
    pub fn mark_unreplayable(&mut self, reason: impl Into<String>) {
        self.unreplayable = Some(reason.into());
    }

    pub fn unreplayable_reason(&self) -> Option<&str> {
        self.unreplayable.as_deref()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 结束录制；不可回放时返回 Err(原因)，但 Trace 仍随 Err 一并交回供输出使用
    pub fn finish(self, question: &str, cache_key: CacheKey) -> Result<Trace, (Trace, String)> {
        let trace = Trace::new(question, cache_key, self.steps);
        match self.unreplayable {
            Some(reason) => Err((trace, reason)),
            None => Ok(trace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{schema_fingerprint, ApiIdentity};

    fn key() -> CacheKey {
        CacheKey::new(ApiIdentity::rest("spec", "base"), schema_fingerprint("s"))
    }

    #[test]
    fn test_records_steps_in_order() {
        let mut rec = TraceRecorder::new();
        rec.record_api_call(ApiRequest::get("/users"), "users");
        rec.record_query("SELECT * FROM users LIMIT 5", "sql_result");
        let trace = rec.finish("Top 5 users", key()).unwrap();
        assert_eq!(trace.steps().len(), 2);
        assert_eq!(trace.steps()[0].kind(), "api_call");
        assert_eq!(trace.steps()[1].output(), "sql_result");
        assert_eq!(trace.question(), "Top 5 users");
    }

    #[test]
    fn test_unreplayable_trace_is_flagged() {
        let mut rec = TraceRecorder::new();
        rec.record_api_call(ApiRequest::get("/jobs/1"), "job");
        rec.mark_unreplayable("polling used");
        let (trace, reason) = rec.finish("job status", key()).unwrap_err();
        assert_eq!(reason, "polling used");
        assert_eq!(trace.api_call_count(), 1);
    }
}
