//! Matcher：在当前 CacheKey 下按问题文本模糊匹配 recipe
//!
//! 只读 Store 快照，不修改任何状态；touch 由调用方在回放成功后执行。

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Deserialize;

use crate::api::CacheKey;

use super::similarity::similarity;
use super::store::RecipeStore;
use super::Recipe;

/// 同分时的优先顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// 使用次数多者优先，再比最近使用
    #[default]
    UseCount,
    /// 最近使用者优先，再比使用次数
    Recency,
}

/// 一条带分数的候选
#[derive(Debug, Clone)]
pub struct Suggestion {
    pub recipe: Arc<Recipe>,
    pub score: f64,
}

pub struct Matcher {
    store: Arc<RecipeStore>,
    threshold: f64,
    tie_break: TieBreak,
}

impl Matcher {
    pub fn new(store: Arc<RecipeStore>, threshold: f64) -> Self {
        Self {
            store,
            threshold,
            tie_break: TieBreak::default(),
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 分数不低于阈值的最佳 recipe
    pub fn find(&self, key: &CacheKey, question: &str) -> Option<Arc<Recipe>> {
        self.find_scored(key, question).map(|s| s.recipe)
    }

    pub fn find_scored(&self, key: &CacheKey, question: &str) -> Option<Suggestion> {
        let best = self.ranked(key, question).into_iter().next()?;
        if best.score >= self.threshold {
            tracing::info!(
                recipe_id = %best.recipe.id(),
                score = best.score,
                cache_key = %key,
                "recipe matched"
            );
            Some(best)
        } else {
            tracing::debug!(score = best.score, threshold = self.threshold, "no recipe above threshold");
            None
        }
    }

    /// 分数大于 0 的前 k 个候选，供推理引擎的提示词使用
    pub fn suggest(&self, key: &CacheKey, question: &str, k: usize) -> Vec<Suggestion> {
        let mut out = self.ranked(key, question);
        out.truncate(k);
        out
    }

    fn ranked(&self, key: &CacheKey, question: &str) -> Vec<Suggestion> {
        let mut scored: Vec<Suggestion> = self
            .store
            .get_candidates(key)
            .into_iter()
            .map(|recipe| Suggestion {
                score: similarity(question, recipe.question()),
                recipe,
            })
            .filter(|s| s.score > 0.0)
            .collect();
        scored.sort_by(|a, b| self.compare(b, a));
        scored
    }

    /// 升序比较：分数，然后按 tie_break 比使用次数与最近使用
    fn compare(&self, a: &Suggestion, b: &Suggestion) -> Ordering {
        let by_count = a.recipe.use_count().cmp(&b.recipe.use_count());
        let by_recency = a.recipe.recency().cmp(&b.recipe.recency());
        let tie = match self.tie_break {
            TieBreak::UseCount => by_count.then(by_recency),
            TieBreak::Recency => by_recency.then(by_count),
        };
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(Ordering::Equal)
            .then(tie)
    }
}

/// 分数的可读提示
pub fn score_hint(score: f64) -> &'static str {
    if score >= 0.8 {
        "strong match"
    } else if score >= 0.6 {
        "good match - verify params"
    } else {
        "possible match - check alignment"
    }
}

/// 候选 recipe 的提示词片段：工具签名、原问题、分数与步骤摘要
pub fn render_suggestions(suggestions: &[Suggestion]) -> String {
    if suggestions.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "<recipes>".to_string(),
        "Available recipe tools (sorted by relevance):".to_string(),
    ];
    for (idx, s) in suggestions.iter().enumerate() {
        let params: Vec<String> = s
            .recipe
            .parameters()
            .iter()
            .map(|p| format!("{}: {} = {}", p.name, p.ty, p.default))
            .collect();
        lines.push(format!("{}. {}({})", idx + 1, s.recipe.name(), params.join(", ")));
        lines.push(format!("   Question: \"{}\"", s.recipe.question()));
        lines.push(format!("   Score: {:.2} ({})", s.score, score_hint(s.score)));
        lines.push(format!("   Steps: {}", s.recipe.steps_summary()));
    }
    lines.push("</recipes>".to_string());
    lines.join("\n")
}
