//! Validator：缓存的唯一入口
//!
//! 用全部默认值渲染候选模板，与原 Trace 逐步做结构比较（步骤数、顺序、种类、目标、输出名、
//! 解析后的字段值）；任何差异都丢弃整个候选。文本部分（SQL、GraphQL 查询）比较前折叠空白，
//! JSON 部分缺省与空对象视为相同。

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::LearnError;
use crate::trace::{ApiRequest, Step, Trace};

use super::template::{defaults_of, Parameter};
use super::{CandidateTemplate, Recipe};

static PARAM_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// 无状态校验器
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// 候选模板 -> Recipe；步骤编号从 1 开始
    pub fn validate(&self, trace: &Trace, candidate: CandidateTemplate) -> Result<Recipe, LearnError> {
        let CandidateTemplate {
            name,
            parameters,
            template,
        } = candidate;

        if trace.steps().is_empty() {
            return Err(LearnError::validation(None, "trace has no steps"));
        }
        if template.steps.len() != trace.steps().len() {
            return Err(LearnError::validation(
                None,
                format!(
                    "step count differs: template {} vs trace {}",
                    template.steps.len(),
                    trace.steps().len()
                ),
            ));
        }

        let parameters = check_parameters(parameters, &template.used_params())?;

        let defaults = defaults_of(&parameters);
        let rendered = template
            .render(&defaults)
            .map_err(|e| LearnError::validation(None, e.to_string()))?;

        for (i, (orig, got)) in trace.steps().iter().zip(&rendered).enumerate() {
            if let Err(reason) = compare_step(orig, got) {
                return Err(LearnError::validation(Some(i + 1), reason));
            }
        }

        let parameters = parameters
            .into_iter()
            .map(|mut p| {
                if let Some((step, field)) = template.first_usage(&p.name) {
                    p.source_step = step;
                    p.source_field = field;
                }
                p
            })
            .collect();

        Ok(Recipe::new(
            trace.cache_key(),
            name,
            trace.question().to_string(),
            template,
            parameters,
        ))
    }
}

/// 声明与引用对齐：引用未声明的参数即失败；声明了参数却一个都没用上也失败；多余的声明被剔除
fn check_parameters(parameters: Vec<Parameter>, used: &BTreeSet<String>) -> Result<Vec<Parameter>, LearnError> {
    let name_re = PARAM_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));
    let mut declared = BTreeSet::new();
    for p in &parameters {
        if !name_re.is_match(&p.name) {
            return Err(LearnError::validation(None, format!("invalid parameter name: {}", p.name)));
        }
        if !declared.insert(p.name.clone()) {
            return Err(LearnError::validation(None, format!("duplicate parameter: {}", p.name)));
        }
        if !p.ty.accepts(&p.default) {
            return Err(LearnError::validation(
                None,
                format!("default of '{}' is not a {}: {}", p.name, p.ty, p.default),
            ));
        }
    }

    if let Some(undeclared) = used.difference(&declared).next() {
        return Err(LearnError::validation(None, format!("undeclared parameter: {undeclared}")));
    }
    if !declared.is_empty() && used.is_empty() {
        return Err(LearnError::validation(None, "parameters declared but none used"));
    }

    let before = parameters.len();
    let kept: Vec<Parameter> = parameters.into_iter().filter(|p| used.contains(&p.name)).collect();
    if kept.len() < before {
        tracing::debug!(pruned = before - kept.len(), "pruned unused recipe parameters");
    }
    Ok(kept)
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canon_map(m: &Map<String, Value>) -> Value {
    Value::Object(m.clone())
}

fn canon_opt(v: Option<&Value>) -> Value {
    match v {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v.clone(),
    }
}

fn compare_step(orig: &Step, got: &Step) -> Result<(), String> {
    if orig.kind() != got.kind() {
        return Err(format!("kind differs: {} vs {}", got.kind(), orig.kind()));
    }
    if orig.output() != got.output() {
        return Err(format!("output differs: {} vs {}", got.output(), orig.output()));
    }
    match (orig, got) {
        (Step::Query(a), Step::Query(b)) => {
            if normalize_ws(&a.sql) != normalize_ws(&b.sql) {
                return Err(format!("sql differs: {} vs {}", b.sql, a.sql));
            }
            Ok(())
        }
        (Step::ApiCall(a), Step::ApiCall(b)) => compare_request(&a.request, &b.request),
        _ => Err("kind differs".to_string()),
    }
}

fn compare_request(orig: &ApiRequest, got: &ApiRequest) -> Result<(), String> {
    match (orig, got) {
        (
            ApiRequest::Graphql {
                query: q1,
                variables: v1,
            },
            ApiRequest::Graphql {
                query: q2,
                variables: v2,
            },
        ) => {
            if normalize_ws(q1) != normalize_ws(q2) {
                return Err("graphql query differs".to_string());
            }
            if canon_opt(v1.as_ref()) != canon_opt(v2.as_ref()) {
                return Err("graphql variables differ".to_string());
            }
            Ok(())
        }
        (
            ApiRequest::Rest {
                method: m1,
                path: p1,
                path_params: pp1,
                query_params: qp1,
                body: b1,
            },
            ApiRequest::Rest {
                method: m2,
                path: p2,
                path_params: pp2,
                query_params: qp2,
                body: b2,
            },
        ) => {
            if !m1.eq_ignore_ascii_case(m2) {
                return Err(format!("method differs: {m2} vs {m1}"));
            }
            if p1 != p2 {
                return Err(format!("path differs: {p2} vs {p1}"));
            }
            if canon_map(pp1) != canon_map(pp2) {
                return Err("path_params differ".to_string());
            }
            if canon_map(qp1) != canon_map(qp2) {
                return Err("query_params differ".to_string());
            }
            if canon_opt(b1.as_ref()) != canon_opt(b2.as_ref()) {
                return Err("body differs".to_string());
            }
            Ok(())
        }
        _ => Err(format!("protocol differs: {:?} vs {:?}", got.protocol(), orig.protocol())),
    }
}
