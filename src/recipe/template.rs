//! Recipe 模板模型
//!
//! 把 Trace 中的字面量提升为具名参数：
//! - JSON 请求部分（REST 的 path/query 参数与 body、GraphQL variables）中用 `{"$param": "name"}` 节点；
//! - 文本部分（GraphQL 查询、SQL）用 `{{name}}` 占位符，解析为片段后按方言转义渲染，而不是字符串拼接。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::trace::{ApiRequest, Step};

/// 渲染失败：模板引用了未绑定的参数
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("missing param: {0}")]
    MissingParam(String),
}

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int", alias = "integer", alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    Date,
    #[serde(alias = "array")]
    List,
}

impl ParamType {
    /// 根据字面量推断类型
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Number(_) => ParamType::Number,
            Value::Bool(_) => ParamType::Boolean,
            Value::Array(_) => ParamType::List,
            Value::String(s) if parse_date(s) => ParamType::Date,
            _ => ParamType::String,
        }
    }

    /// 值是否符合类型（null 视为未设置，总是接受）
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ParamType::String, Value::String(_)) => true,
            (ParamType::Number, Value::Number(_)) => true,
            (ParamType::Boolean, Value::Bool(_)) => true,
            (ParamType::Date, Value::String(s)) => parse_date(s),
            (ParamType::List, Value::Array(_)) => true,
            _ => false,
        }
    }

    /// 宽松转换：数字与布尔接受字符串形式
    pub fn coerce(&self, value: Value) -> Result<Value, Value> {
        if self.accepts(&value) {
            return Ok(value);
        }
        let coerced = match (self, &value) {
            (ParamType::Number, Value::String(s)) => parse_number(s.trim()),
            (ParamType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            (ParamType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            _ => None,
        };
        coerced.ok_or(value)
    }

    /// JSON Schema 的 type 字段
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            ParamType::String | ParamType::Date => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::List => "array",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Date => "date",
            ParamType::List => "list",
        };
        f.write_str(s)
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn parse_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
}

/// 可由调用方绑定的参数槽；默认值等于原始 Trace 中的字面量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub default: Value,
    /// 首次使用该参数的步骤（从 0 开始）
    #[serde(default)]
    pub source_step: usize,
    /// 首次使用的位置，如 "query_params.limit"、"sql"
    #[serde(default)]
    pub source_field: String,
}

/// JSON 值模板：字面量、参数引用、或嵌套的数组 / 对象
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Literal(Value),
    Param(String),
    Array(Vec<TemplateValue>),
    Object(BTreeMap<String, TemplateValue>),
}

impl TemplateValue {
    pub fn param(name: impl Into<String>) -> Self {
        TemplateValue::Param(name.into())
    }

    /// 用参数表渲染为具体 JSON
    pub fn render(&self, params: &Map<String, Value>) -> Result<Value, RenderError> {
        match self {
            TemplateValue::Literal(v) => Ok(v.clone()),
            TemplateValue::Param(name) => params
                .get(name)
                .cloned()
                .ok_or_else(|| RenderError::MissingParam(name.clone())),
            TemplateValue::Array(items) => items
                .iter()
                .map(|i| i.render(params))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            TemplateValue::Object(fields) => {
                let mut out = Map::new();
                for (k, v) in fields {
                    out.insert(k.clone(), v.render(params)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    /// 收集参数引用及其字段路径
    fn collect_params(&self, path: &str, out: &mut Vec<(String, String)>) {
        match self {
            TemplateValue::Literal(_) => {}
            TemplateValue::Param(name) => out.push((name.clone(), path.to_string())),
            TemplateValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_params(&format!("{path}[{i}]"), out);
                }
            }
            TemplateValue::Object(fields) => {
                for (k, v) in fields {
                    v.collect_params(&format!("{path}.{k}"), out);
                }
            }
        }
    }

    fn is_empty_object(&self) -> bool {
        matches!(self, TemplateValue::Object(m) if m.is_empty())
            || matches!(self, TemplateValue::Literal(Value::Object(m)) if m.is_empty())
    }
}

impl From<Value> for TemplateValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(name)) = map.get("$param") {
                        return TemplateValue::Param(name.clone());
                    }
                }
                TemplateValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Value::Array(items) => TemplateValue::Array(items.into_iter().map(Into::into).collect()),
            other => TemplateValue::Literal(other),
        }
    }
}

impl From<TemplateValue> for Value {
    fn from(t: TemplateValue) -> Self {
        match t {
            TemplateValue::Literal(v) => v,
            TemplateValue::Param(name) => {
                let mut m = Map::new();
                m.insert("$param".to_string(), Value::String(name));
                Value::Object(m)
            }
            TemplateValue::Array(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            TemplateValue::Object(fields) => {
                Value::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl Serialize for TemplateValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TemplateValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Into::into)
    }
}

impl Default for TemplateValue {
    fn default() -> Self {
        TemplateValue::Object(BTreeMap::new())
    }
}

/// 文本方言：决定参数值如何转义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDialect {
    /// 字符串中单引号加倍；列表渲染为逗号分隔的 SQL 字面量
    Sql,
    /// 字符串按 JSON 字符串内容转义；列表渲染为 JSON 数组
    GraphQl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Param(String),
}

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

/// 带 `{{name}}` 占位符的文本模板，解析为文本 / 参数片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TextTemplate {
    pub fn parse(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut segments = Vec::new();
        let mut last = 0;
        for cap in placeholder_re().captures_iter(&source) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Text(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Param(name.as_str().to_string()));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Text(source[last..].to_string()));
        }
        Self { source, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn params(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name) => Some(name.clone()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    pub fn render(&self, params: &Map<String, Value>, dialect: TextDialect) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| RenderError::MissingParam(name.clone()))?;
                    out.push_str(&render_text_value(value, dialect));
                }
            }
        }
        Ok(out)
    }
}

fn render_text_value(value: &Value, dialect: TextDialect) -> String {
    match (value, dialect) {
        (Value::Null, _) => "null".to_string(),
        (Value::Bool(b), _) => b.to_string(),
        (Value::Number(n), _) => n.to_string(),
        (Value::String(s), TextDialect::Sql) => s.replace('\'', "''"),
        (Value::String(s), TextDialect::GraphQl) => {
            let quoted = Value::String(s.clone()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        }
        (Value::Array(items), TextDialect::Sql) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => format!("'{}'", s.replace('\'', "''")),
                other => render_text_value(other, TextDialect::Sql),
            })
            .collect::<Vec<_>>()
            .join(", "),
        (Value::Array(_), TextDialect::GraphQl) => value.to_string(),
        (Value::Object(_), TextDialect::Sql) => value.to_string().replace('\'', "''"),
        (Value::Object(_), TextDialect::GraphQl) => value.to_string(),
    }
}

impl Serialize for TextTemplate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for TextTemplate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(TextTemplate::parse)
    }
}

/// 模板化的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TemplateRequest {
    Graphql {
        query: TextTemplate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<TemplateValue>,
    },
    Rest {
        method: String,
        path: String,
        #[serde(default)]
        path_params: TemplateValue,
        #[serde(default)]
        query_params: TemplateValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<TemplateValue>,
    },
}

/// 模板化的步骤，与 Step 一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateStep {
    ApiCall {
        request: TemplateRequest,
        output: String,
    },
    Query {
        sql: TextTemplate,
        output: String,
    },
}

impl TemplateStep {
    pub fn kind(&self) -> &'static str {
        match self {
            TemplateStep::ApiCall { .. } => "api_call",
            TemplateStep::Query { .. } => "query",
        }
    }

    pub fn output(&self) -> &str {
        match self {
            TemplateStep::ApiCall { output, .. } | TemplateStep::Query { output, .. } => output,
        }
    }

    /// 用参数表渲染为具体步骤
    pub fn render(&self, params: &Map<String, Value>) -> Result<Step, RenderError> {
        match self {
            TemplateStep::Query { sql, output } => {
                Ok(Step::query(sql.render(params, TextDialect::Sql)?, output.clone()))
            }
            TemplateStep::ApiCall { request, output } => {
                let request = match request {
                    TemplateRequest::Graphql { query, variables } => ApiRequest::Graphql {
                        query: query.render(params, TextDialect::GraphQl)?,
                        variables: variables.as_ref().map(|v| v.render(params)).transpose()?,
                    },
                    TemplateRequest::Rest {
                        method,
                        path,
                        path_params,
                        query_params,
                        body,
                    } => ApiRequest::Rest {
                        method: method.to_uppercase(),
                        path: path.clone(),
                        path_params: as_object(path_params.render(params)?),
                        query_params: as_object(query_params.render(params)?),
                        body: body
                            .as_ref()
                            .filter(|b| !b.is_empty_object())
                            .map(|b| b.render(params))
                            .transpose()?,
                    },
                };
                Ok(Step::api_call(request, output.clone()))
            }
        }
    }

    /// (参数名, 字段路径) 列表，按出现顺序
    pub fn param_usages(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        match self {
            TemplateStep::Query { sql, .. } => {
                out.extend(sql.params().into_iter().map(|p| (p, "sql".to_string())));
            }
            TemplateStep::ApiCall { request, .. } => match request {
                TemplateRequest::Graphql { query, variables } => {
                    out.extend(query.params().into_iter().map(|p| (p, "query".to_string())));
                    if let Some(v) = variables {
                        v.collect_params("variables", &mut out);
                    }
                }
                TemplateRequest::Rest {
                    path_params,
                    query_params,
                    body,
                    ..
                } => {
                    path_params.collect_params("path_params", &mut out);
                    query_params.collect_params("query_params", &mut out);
                    if let Some(b) = body {
                        b.collect_params("body", &mut out);
                    }
                }
            },
        }
        out
    }
}

fn as_object(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

/// 参数化、可回放的 Trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeTemplate {
    pub steps: Vec<TemplateStep>,
}

impl RecipeTemplate {
    pub fn new(steps: Vec<TemplateStep>) -> Self {
        Self { steps }
    }

    pub fn render(&self, params: &Map<String, Value>) -> Result<Vec<Step>, RenderError> {
        self.steps.iter().map(|s| s.render(params)).collect()
    }

    /// 模板中实际引用的参数名
    pub fn used_params(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|s| s.param_usages())
            .map(|(name, _)| name)
            .collect()
    }

    /// 参数首次出现的位置：(步骤下标, 字段路径)
    pub fn first_usage(&self, name: &str) -> Option<(usize, String)> {
        self.steps.iter().enumerate().find_map(|(i, s)| {
            s.param_usages()
                .into_iter()
                .find(|(p, _)| p == name)
                .map(|(_, field)| (i, field))
        })
    }

    pub fn api_call_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, TemplateStep::ApiCall { .. }))
            .count()
    }

    pub fn query_count(&self) -> usize {
        self.steps.len() - self.api_call_count()
    }
}

/// 参数默认值表
pub fn defaults_of(parameters: &[Parameter]) -> Map<String, Value> {
    parameters
        .iter()
        .map(|p| (p.name.clone(), p.default.clone()))
        .collect()
}

/// 将调用方参数合并到默认值之上：未知参数名或类型不符即拒绝
pub fn bind_params(parameters: &[Parameter], supplied: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    let mut bound = defaults_of(parameters);
    for (name, value) in supplied {
        let Some(spec) = parameters.iter().find(|p| &p.name == name) else {
            return Err(format!("unknown parameter: {name}"));
        };
        if value.is_null() {
            continue;
        }
        let value = spec
            .ty
            .coerce(value.clone())
            .map_err(|v| format!("parameter '{name}' expects {}, got {v}", spec.ty))?;
        bound.insert(name.clone(), value);
    }
    Ok(bound)
}
