//! 可观测性：tracing 初始化与回放步骤审计日志

use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 请求预览的最大字符数
pub const PREVIEW_MAX_CHARS: usize = 200;

/// 默认 info，可由 RUST_LOG 覆盖
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 值的紧凑 JSON，超出 max_chars 截断并加 "..."
pub fn request_preview(value: &Value, max_chars: usize) -> String {
    let s = value.to_string();
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s
    }
}

/// 一次回放步骤的审计记录
#[derive(Debug, Clone)]
pub struct StepAudit<'a> {
    /// 从 1 开始
    pub step: usize,
    pub kind: &'a str,
    pub ok: bool,
    pub outcome: &'a str,
    pub duration_ms: u64,
    pub request: &'a Value,
}

impl StepAudit<'_> {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "event": "replay_step_audit",
            "step": self.step,
            "kind": self.kind,
            "ok": self.ok,
            "outcome": self.outcome,
            "duration_ms": self.duration_ms,
            "request_preview": request_preview(self.request, PREVIEW_MAX_CHARS),
        })
    }

    pub fn emit(&self) {
        tracing::info!(audit = %self.to_json(), "replay step");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_preview_truncates() {
        let v = json!({"q": "x".repeat(500)});
        let p = request_preview(&v, 200);
        assert_eq!(p.chars().count(), 203);
        assert!(p.ends_with("..."));
        assert_eq!(request_preview(&json!(1), 200), "1");
    }

    #[test]
    fn test_audit_shape() {
        let req = json!({"kind": "rest", "path": "/users"});
        let audit = StepAudit {
            step: 2,
            kind: "api_call",
            ok: false,
            outcome: "error",
            duration_ms: 12,
            request: &req,
        }
        .to_json();
        assert_eq!(audit["event"], "replay_step_audit");
        assert_eq!(audit["step"], 2);
        assert_eq!(audit["outcome"], "error");
    }
}
