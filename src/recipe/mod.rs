//! Recipe 学习与回放
//!
//! - template: 参数化模板模型
//! - generalizer: 委托 LLM 把 Trace 中的字面量提升为参数（非确定）
//! - validator: 默认值渲染后与原 Trace 做结构比较，唯一的入库关口
//! - store: 有界 LRU、并发安全的 Recipe 存储
//! - matcher: 模糊匹配问题文本
//! - replay: 绑定参数并确定性地重放

pub mod generalizer;
pub mod matcher;
pub mod naming;
pub mod replay;
pub mod similarity;
pub mod store;
pub mod template;
pub mod validator;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::api::CacheKey;

pub use generalizer::Generalizer;
pub use matcher::{render_suggestions, score_hint, Matcher, Suggestion, TieBreak};
pub use naming::{deduplicate_tool_name, is_valid_tool_name, sanitize_tool_name};
pub use replay::{plan_levels, ReplayExecutor};
pub use similarity::similarity;
pub use store::{PutOutcome, RecipeStore};
pub use template::{
    bind_params, defaults_of, ParamType, Parameter, RecipeTemplate, TemplateRequest, TemplateStep,
    TemplateValue, TextDialect, TextTemplate,
};
pub use validator::Validator;

/// Generalizer 的产出：尚未校验，绝不直接入库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTemplate {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub template: RecipeTemplate,
}

/// 已校验、可缓存的参数化 Trace
///
/// 除 `last_used_at` / `use_count` / 最近使用序号外不可变；这三者为原子量，
/// 读锁下即可更新，不需要同步其余字段。
#[derive(Debug)]
pub struct Recipe {
    id: String,
    cache_key: CacheKey,
    name: String,
    question: String,
    template: RecipeTemplate,
    parameters: Vec<Parameter>,
    created_at: DateTime<Utc>,
    last_used_at: AtomicI64,
    use_count: AtomicU64,
    recency: AtomicU64,
}

impl Recipe {
    pub(crate) fn new(
        cache_key: CacheKey,
        name: String,
        question: String,
        template: RecipeTemplate,
        parameters: Vec<Parameter>,
    ) -> Self {
        let now = Utc::now();
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("r_{}", &simple[..8]),
            cache_key,
            name,
            question,
            template,
            parameters,
            created_at: now,
            last_used_at: AtomicI64::new(now.timestamp_millis()),
            use_count: AtomicU64::new(0),
            recency: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// 工具名（同一 CacheKey 下唯一）
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn template(&self) -> &RecipeTemplate {
        &self.template
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used_at.load(Ordering::Acquire))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Acquire)
    }

    /// 店内逻辑时钟序号，越大越新；LRU 以此排序
    pub(crate) fn recency(&self) -> u64 {
        self.recency.load(Ordering::Acquire)
    }

    pub(crate) fn set_recency(&self, tick: u64) {
        self.recency.store(tick, Ordering::Release);
    }

    /// 成功回放后：刷新最近使用时间与序号，计数加一
    pub(crate) fn mark_used(&self, tick: u64) {
        self.last_used_at
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.use_count.fetch_add(1, Ordering::AcqRel);
        self.recency.store(tick, Ordering::Release);
    }

    /// 同问题替换时沿用旧 id 与使用计数
    pub(crate) fn inherit_from(&mut self, previous: &Recipe) {
        self.id = previous.id.clone();
        self.created_at = previous.created_at;
        self.use_count = AtomicU64::new(previous.use_count());
    }

    pub(crate) fn with_name(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    /// 默认参数表
    pub fn defaults(&self) -> Map<String, Value> {
        defaults_of(&self.parameters)
    }

    /// 例如 "2 API calls + 1 SQL step"
    pub fn steps_summary(&self) -> String {
        steps_summary(self.template.api_call_count(), self.template.query_count())
    }

    /// 参数的 JSON Schema，供外层注册为可独立调用的工具
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = json!({
                "type": p.ty.json_schema_type(),
                "default": p.default,
            });
            match p.ty {
                ParamType::Date => {
                    prop["format"] = json!("date");
                }
                ParamType::List => {
                    prop["items"] = json!({});
                }
                _ => {}
            }
            properties.insert(p.name.clone(), prop);
        }
        json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        })
    }

    /// 工具描述：{name, description, parameters}
    pub fn tool_spec(&self) -> Value {
        json!({
            "name": self.name,
            "description": format!(
                "Execute recipe: {}\n\nRecipe performs: {}",
                self.question,
                self.steps_summary()
            ),
            "parameters": self.parameters_schema(),
        })
    }

    /// 可序列化的元数据快照
    pub fn meta(&self) -> RecipeMeta {
        RecipeMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            question: self.question.clone(),
            api: self.cache_key.api.to_string(),
            schema_fingerprint: self.cache_key.fingerprint.to_string(),
            parameters: self.parameters.clone(),
            steps: self.steps_summary(),
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            use_count: self.use_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeMeta {
    pub id: String,
    pub name: String,
    pub question: String,
    pub api: String,
    pub schema_fingerprint: String,
    pub parameters: Vec<Parameter>,
    pub steps: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

pub(crate) fn steps_summary(api_calls: usize, queries: usize) -> String {
    let mut parts = Vec::new();
    if api_calls > 0 {
        parts.push(plural(api_calls, "API call"));
    }
    if queries > 0 {
        parts.push(plural(queries, "SQL step"));
    }
    if parts.is_empty() {
        "no steps".to_string()
    } else {
        parts.join(" + ")
    }
}
