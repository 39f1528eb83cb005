//! Replay Executor：绑定参数、渲染模板、确定性地重放，不调用推理引擎
//!
//! 步骤按数据依赖分层：查询依赖它引用到的更早步骤的输出表；同名输出之间保持写后写、读后写顺序。
//! 同一层内的 API 调用以有限并发执行（结果按原顺序登记），查询在同层 API 结果登记后依次执行。
//! 任一步失败即中止，临时执行上下文随之丢弃；全部成功后才 touch。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, CacheKey};
use crate::context::{extract_rows, referenced_tables, ExecutionContext, PreviewBudget};
use crate::core::{ReplayError, StepFailure};
use crate::observability::StepAudit;
use crate::trace::{ApiRequest, RunOutput, Step, Trace};

use super::store::RecipeStore;
use super::template::bind_params;
use super::Recipe;

/// 每个步骤所在的层（从 0 开始），层内无相互依赖
pub fn plan_levels(steps: &[Step]) -> Vec<Vec<usize>> {
    let mut level_of: Vec<usize> = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let earlier = &steps[..i];
        let outputs: Vec<String> = earlier.iter().map(|s| s.output().to_string()).collect();
        let reads: HashSet<String> = match step {
            Step::Query(q) => referenced_tables(&q.sql, &outputs).into_iter().collect(),
            Step::ApiCall(_) => HashSet::new(),
        };
        let level = earlier
            .iter()
            .enumerate()
            .filter(|(_, prev)| {
                // 读后写：本步读取 prev 的输出；写后写：同名输出；写后读：prev 读取本步要覆盖的表
                reads.contains(prev.output())
                    || prev.output() == step.output()
                    || matches!(prev, Step::Query(q)
                        if referenced_tables(&q.sql, &[step.output().to_string()]).len() == 1)
            })
            .map(|(j, _)| level_of[j] + 1)
            .max()
            .unwrap_or(0);
        level_of.push(level);
    }

    let depth = level_of.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut levels = vec![Vec::new(); depth];
    for (i, level) in level_of.into_iter().enumerate() {
        levels[level].push(i);
    }
    levels
}

fn step_error(index: usize, cause: impl Into<StepFailure>) -> ReplayError {
    ReplayError::ReplayExecutionError {
        step: index + 1,
        cause: cause.into(),
    }
}

fn audit(index: usize, step: &Step, ok: bool, outcome: &str, started: Instant) {
    let request = match step {
        Step::ApiCall(s) => serde_json::to_value(&s.request).unwrap_or(Value::Null),
        Step::Query(s) => json!({ "sql": s.sql }),
    };
    StepAudit {
        step: index + 1,
        kind: step.kind(),
        ok,
        outcome,
        duration_ms: started.elapsed().as_millis() as u64,
        request: &request,
    }
    .emit();
}

/// 回放执行器
pub struct ReplayExecutor {
    store: Arc<RecipeStore>,
    api: Arc<dyn ApiClient>,
    concurrency: usize,
    budget: PreviewBudget,
}

impl ReplayExecutor {
    pub fn new(store: Arc<RecipeStore>, api: Arc<dyn ApiClient>, concurrency: usize) -> Self {
        Self {
            store,
            api,
            concurrency: concurrency.max(1),
            budget: PreviewBudget::default(),
        }
    }

    pub fn with_budget(mut self, budget: PreviewBudget) -> Self {
        self.budget = budget;
        self
    }

    pub async fn replay(&self, recipe: &Recipe, params: &Map<String, Value>) -> Result<RunOutput, ReplayError> {
        self.replay_with_cancel(recipe, params, &CancellationToken::new())
            .await
    }

    /// 校验 recipe 属于当前 CacheKey 后回放
    pub async fn replay_for(
        &self,
        key: &CacheKey,
        recipe: &Recipe,
        params: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, ReplayError> {
        if recipe.cache_key() != key {
            return Err(ReplayError::SchemaMismatch);
        }
        self.replay_with_cancel(recipe, params, cancel).await
    }

    /// 可取消的回放；取消时已执行步骤的表一并丢弃
    pub async fn replay_with_cancel(
        &self,
        recipe: &Recipe,
        params: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, ReplayError> {
        let bound = bind_params(recipe.parameters(), params).map_err(ReplayError::BadParameterError)?;

        if self.store.get(recipe.id()).is_none() {
            tracing::info!(recipe_id = %recipe.id(), "recipe evicted before replay");
            return Err(ReplayError::EvictionRace(recipe.id().to_string()));
        }

        let steps = recipe
            .template()
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| s.render(&bound).map_err(|e| step_error(i, StepFailure::Render(e.to_string()))))
            .collect::<Result<Vec<_>, _>>()?;
        let trace = Trace::new(recipe.question(), recipe.cache_key().clone(), steps);

        let started = Instant::now();
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(recipe_id = %recipe.id(), "replay cancelled");
                return Err(ReplayError::Cancelled);
            }
            r = self.run_trace(&trace) => r,
        };

        match output {
            Ok(out) => {
                if !self.store.touch(recipe.id()) {
                    tracing::debug!(recipe_id = %recipe.id(), "recipe evicted during replay");
                }
                tracing::info!(
                    recipe_id = %recipe.id(),
                    rows = out.row_count(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "recipe replayed"
                );
                Ok(out)
            }
            Err(e) => {
                tracing::warn!(recipe_id = %recipe.id(), error = %e, "recipe replay failed");
                Err(e)
            }
        }
    }

    /// 在全新的执行上下文中执行已渲染的 Trace（不经过 Store，也不 touch）
    pub async fn run_trace(&self, trace: &Trace) -> Result<RunOutput, ReplayError> {
        let mut ctx = ExecutionContext::with_budget(self.budget).map_err(|e| step_error(0, e))?;
        let steps = trace.steps();

        for level in plan_levels(steps) {
            let calls: Vec<(usize, &ApiRequest)> = level
                .iter()
                .filter_map(|&i| match &steps[i] {
                    Step::ApiCall(s) => Some((i, &s.request)),
                    Step::Query(_) => None,
                })
                .collect();

            let mut fetched = stream::iter(calls)
                .map(|(i, request)| async move {
                    let started = Instant::now();
                    let result = self.api.execute(request).await;
                    (i, started, result)
                })
                .buffered(self.concurrency);

            while let Some((i, started, result)) = fetched.next().await {
                match result {
                    Ok(data) => {
                        let registered = ctx.create_table(steps[i].output(), extract_rows(&data));
                        if let Err(e) = registered {
                            audit(i, &steps[i], false, "error", started);
                            return Err(step_error(i, e));
                        }
                        audit(i, &steps[i], true, "ok", started);
                    }
                    Err(e) => {
                        audit(i, &steps[i], false, "error", started);
                        return Err(step_error(i, e));
                    }
                }
            }

            for &i in &level {
                if let Step::Query(q) = &steps[i] {
                    let started = Instant::now();
                    let result = ctx.query_into(&q.sql, &q.output);
                    audit(i, &steps[i], result.is_ok(), if result.is_ok() { "ok" } else { "error" }, started);
                    result.map_err(|e| step_error(i, e))?;
                }
            }
        }

        Ok(RunOutput::from_trace(trace, &ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(sql: &str, out: &str) -> Step {
        Step::query(sql, out)
    }

    fn get(path: &str, out: &str) -> Step {
        Step::api_call(ApiRequest::get(path), out)
    }

    #[test]
    fn test_independent_calls_share_a_level() {
        let steps = vec![
            get("/users", "users"),
            get("/posts", "posts"),
            q("SELECT u.name, p.title FROM users u JOIN posts p ON u.id = p.author_id", "sql_result"),
        ];
        assert_eq!(plan_levels(&steps), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_chained_queries_and_overwrites() {
        let steps = vec![
            get("/users", "users"),
            q("SELECT * FROM users WHERE age > 30", "older"),
            q("SELECT COUNT(*) AS n FROM older", "sql_result"),
            get("/users?page=2", "users"),
        ];
        // 最后一步覆盖 users，须在读取 users 的查询之后
        assert_eq!(plan_levels(&steps), vec![vec![0], vec![1], vec![2, 3]]);
    }

    #[test]
    fn test_empty_plan() {
        assert!(plan_levels(&[]).is_empty());
    }
}
