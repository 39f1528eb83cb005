//! Generalizer：把具体 Trace 交给推理引擎，判断哪些字面量应提升为参数
//!
//! 单次调用、不重试；输出只是候选，必须经过 Validator 才能入库。

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::core::LearnError;
use crate::llm::{LlmClient, Message};
use crate::trace::Trace;

use super::naming::{is_valid_tool_name, sanitize_tool_name};
use super::template::{ParamType, Parameter, TemplateStep};
use super::{CandidateTemplate, RecipeTemplate};

const GENERALIZER_PROMPT: &str = r#"You are a recipe extractor. Convert an executed API trace into a reusable template.

INPUT: {"question": "...", "steps": [...]} where each step is either
- {"type": "api_call", "output": "<table>", "request": {...}} or
- {"type": "query", "output": "<table>", "sql": "..."}

OUTPUT: a single JSON object (no markdown):
{
  "tool_name": "<snake_case_name>",
  "params": {"paramName": {"type": "string|number|boolean|date|list", "default": <value_from_trace>}},
  "steps": [<same length and order as input>]
}

TOOL_NAME: lowercase snake_case, max 40 chars, starts with a verb (get, list, find, search...).

STEP FORMATS:
- REST: {"type": "api_call", "output": "...", "request": {"kind": "rest", "method": "GET", "path": "/x", "path_params": {}, "query_params": {}, "body": null}}
  Use {"$param": "paramName"} for parameterized values inside path_params, query_params and body.
- GraphQL: {"type": "api_call", "output": "...", "request": {"kind": "graphql", "query": "...{{paramName}}...", "variables": {...}}}
  Use {{paramName}} inside the query text, {"$param": "paramName"} inside variables.
- SQL: {"type": "query", "output": "...", "sql": "... LIMIT {{paramName}}"}
  String params are inserted without quotes: write '{{name}}%' for a LIKE prefix.

PARAMETERIZE user-specific values: ids, limits, offsets, search terms, filters, dates, LIKE patterns.
DO NOT parameterize: paths, methods, field names, table names, output names.

RULES:
- Keep the SAME number of steps in the SAME order with the SAME output names.
- Every default MUST equal the literal in the trace, so rendering with defaults reproduces the trace exactly.
- Output valid JSON only."#;

/// Generalizer：持有推理引擎客户端
pub struct Generalizer {
    llm: Arc<dyn LlmClient>,
}

impl Generalizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Trace -> 候选模板；推理引擎出错或输出不可用时返回 GeneralizationFailure
    pub async fn generalize(&self, trace: &Trace) -> Result<CandidateTemplate, LearnError> {
        let payload = json!({
            "question": trace.question(),
            "steps": trace.steps(),
        });
        let pretty = serde_json::to_string_pretty(&payload)
            .map_err(|e| LearnError::GeneralizationFailure(e.to_string()))?;
        let messages = vec![Message::system(GENERALIZER_PROMPT), Message::user(pretty)];

        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| LearnError::GeneralizationFailure(e.to_string()))?;
        let candidate = parse_candidate(&output)?;
        tracing::debug!(
            name = %candidate.name,
            params = candidate.parameters.len(),
            steps = candidate.template.steps.len(),
            "generalizer produced candidate"
        );
        Ok(candidate)
    }
}

fn failure(reason: impl Into<String>) -> LearnError {
    LearnError::GeneralizationFailure(reason.into())
}

/// 提取 JSON 块（```json ... ``` 或首尾花括号之间）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析推理引擎输出为候选模板
pub fn parse_candidate(output: &str) -> Result<CandidateTemplate, LearnError> {
    let json_str = extract_json(output).ok_or_else(|| failure("no JSON object in output"))?;
    let value: Value = serde_json::from_str(json_str).map_err(|e| failure(format!("invalid JSON: {e}")))?;
    let obj = value.as_object().ok_or_else(|| failure("output is not a JSON object"))?;

    let raw_name = obj
        .get("tool_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| failure("missing tool_name"))?;
    let name = if is_valid_tool_name(raw_name) {
        raw_name.to_string()
    } else {
        sanitize_tool_name(raw_name)
    };

    let parameters = match obj.get("params") {
        Some(Value::Object(params)) => parse_params(params)?,
        _ => Vec::new(),
    };

    let steps = obj
        .get("steps")
        .cloned()
        .ok_or_else(|| failure("missing steps"))?;
    let steps: Vec<TemplateStep> =
        serde_json::from_value(steps).map_err(|e| failure(format!("invalid steps: {e}")))?;

    Ok(CandidateTemplate {
        name,
        parameters,
        template: RecipeTemplate::new(steps),
    })
}

fn parse_params(params: &Map<String, Value>) -> Result<Vec<Parameter>, LearnError> {
    params
        .iter()
        .map(|(name, spec)| {
            let spec = spec
                .as_object()
                .ok_or_else(|| failure(format!("param '{name}' spec is not an object")))?;
            let default = spec
                .get("default")
                .cloned()
                .ok_or_else(|| failure(format!("param '{name}' has no default")))?;
            let ty = match spec.get("type") {
                Some(t) => serde_json::from_value::<ParamType>(t.clone())
                    .map_err(|_| failure(format!("param '{name}' has unknown type {t}")))?,
                None => ParamType::infer(&default),
            };
            Ok(Parameter {
                name: name.clone(),
                ty,
                default,
                source_step: 0,
                source_field: String::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{schema_fingerprint, ApiIdentity, CacheKey};
    use crate::llm::MockLlmClient;
    use crate::trace::{ApiRequest, Step};

    const CANDIDATE: &str = r#"Here you go:
```json
{
  "tool_name": "get_top_users_by_age",
  "params": {"limit": {"type": "int", "default": 5}},
  "steps": [
    {"type": "api_call", "output": "users", "request": {"kind": "rest", "method": "GET", "path": "/users"}},
    {"type": "query", "output": "sql_result", "sql": "SELECT * FROM users ORDER BY age DESC LIMIT {{limit}}"}
  ]
}
```"#;

    fn trace() -> Trace {
        Trace::new(
            "Top 5 users by age",
            CacheKey::new(ApiIdentity::rest("spec", "http://api"), schema_fingerprint("s")),
            vec![
                Step::api_call(ApiRequest::get("/users"), "users"),
                Step::query("SELECT * FROM users ORDER BY age DESC LIMIT 5", "sql_result"),
            ],
        )
    }

    #[test]
    fn test_parse_candidate_from_markdown() {
        let c = parse_candidate(CANDIDATE).unwrap();
        assert_eq!(c.name, "get_top_users_by_age");
        assert_eq!(c.parameters.len(), 1);
        assert_eq!(c.parameters[0].ty, ParamType::Number);
        assert_eq!(c.parameters[0].default, json!(5));
        assert_eq!(c.template.steps.len(), 2);
    }

    #[test]
    fn test_parse_candidate_failures() {
        assert!(matches!(parse_candidate("no json here"), Err(LearnError::GeneralizationFailure(_))));
        assert!(parse_candidate(r#"{"params": {}, "steps": []}"#).is_err());
        assert!(parse_candidate(r#"{"tool_name": "x", "params": {"a": {"type": "int"}}, "steps": []}"#).is_err());
        assert!(parse_candidate(r#"{"tool_name": "x", "steps": [{"type": "bogus"}]}"#).is_err());
    }

    #[test]
    fn test_invalid_tool_name_is_sanitized() {
        let c = parse_candidate(r#"{"tool_name": "Get Users!", "steps": []}"#).unwrap();
        assert_eq!(c.name, "get_users");
    }

    #[tokio::test]
    async fn test_generalize_sends_trace_and_parses() {
        let llm = Arc::new(MockLlmClient::with_responses([CANDIDATE]));
        let g = Generalizer::new(llm.clone());
        let c = g.generalize(&trace()).await.unwrap();
        assert_eq!(c.name, "get_top_users_by_age");
        let sent = llm.last_messages().unwrap();
        assert!(sent[1].content.contains("Top 5 users by age"));
        assert!(sent[1].content.contains("LIMIT 5"));
    }

    #[tokio::test]
    async fn test_llm_error_is_generalization_failure() {
        let g = Generalizer::new(Arc::new(MockLlmClient::new()));
        assert!(matches!(
            g.generalize(&trace()).await,
            Err(LearnError::GeneralizationFailure(_))
        ));
    }
}
