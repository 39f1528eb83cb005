//! RecipeEngine：组合根
//!
//! 显式构造共享的 RecipeStore，并把它交给 Matcher、Learner 与 ReplayExecutor。
//! answer 驱动一个问题的生命周期：先匹配，命中则回放，未命中或回放失败则回退到实时推理；
//! 实时推理成功后在后台学习，学习失败只记日志，不影响答案。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, CacheKey};
use crate::config::AppConfig;
use crate::context::{ExecutionContext, PreviewBudget};
use crate::core::{AnswerError, LearnError, LlmError, QuestionLifecycle, QuestionPhase, ReplayError};
use crate::llm::LlmClient;
use crate::recipe::{Generalizer, Matcher, PutOutcome, RecipeStore, ReplayExecutor, Suggestion, Validator};
use crate::trace::{RunOutput, Trace, TraceRecorder};

/// 外部推理循环的边界：在给定执行上下文中回答问题，并把成功的步骤记入 recorder
#[async_trait]
pub trait LiveReasoner: Send + Sync {
    async fn run(
        &self,
        question: &str,
        ctx: &mut ExecutionContext,
        recorder: &mut TraceRecorder,
    ) -> Result<(), LlmError>;
}

/// Generalizer + Validator + Store 写入
pub struct Learner {
    generalizer: Generalizer,
    validator: Validator,
    store: Arc<RecipeStore>,
    enabled: bool,
}

impl Learner {
    pub fn new(generalizer: Generalizer, store: Arc<RecipeStore>, enabled: bool) -> Self {
        Self {
            generalizer,
            validator: Validator::new(),
            store,
            enabled,
        }
    }

    /// 从一次成功的实时 Trace 学习 recipe；只有通过校验的候选才会入库
    pub async fn learn(&self, trace: &Trace) -> Result<PutOutcome, LearnError> {
        if !self.enabled {
            return Err(LearnError::Disabled);
        }
        if trace.api_call_count() == 0 {
            return Err(LearnError::Skipped("trace has no API calls".into()));
        }
        let candidate = self.generalizer.generalize(trace).await?;
        let recipe = self.validator.validate(trace, candidate)?;
        Ok(self.store.put(recipe))
    }
}

/// 答案来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerSource {
    Replayed { recipe_id: String },
    Live,
}

/// 一次回答：输出与实时 / 回放无关，来源与生命周期另附
#[derive(Debug)]
pub struct Answer {
    pub output: RunOutput,
    pub source: AnswerSource,
    pub lifecycle: QuestionLifecycle,
    /// 后台学习任务（仅实时推理且 Trace 可学习时存在）
    pub learning: Option<JoinHandle<Result<PutOutcome, LearnError>>>,
}

impl Answer {
    /// 等待后台学习结束，并把生命周期推进到 Cached 或 DiscardedSilently
    pub async fn wait_learning(&mut self) -> Option<Result<PutOutcome, LearnError>> {
        let handle = self.learning.take()?;
        let result = handle.await.unwrap_or(Err(LearnError::Cancelled));
        advance(&mut self.lifecycle, learning_phase(&result));
        Some(result)
    }
}

pub struct RecipeEngine {
    config: AppConfig,
    store: Arc<RecipeStore>,
    matcher: Matcher,
    learner: Arc<Learner>,
    replay: ReplayExecutor,
    shutdown: CancellationToken,
}

impl RecipeEngine {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, api: Arc<dyn ApiClient>) -> Self {
        let store = Arc::new(RecipeStore::new(config.recipes.cache_size));
        Self::with_store(config, store, llm, api)
    }

    /// 使用外部传入的 Store（多个引擎共享同一进程级缓存时）
    pub fn with_store(
        config: AppConfig,
        store: Arc<RecipeStore>,
        llm: Arc<dyn LlmClient>,
        api: Arc<dyn ApiClient>,
    ) -> Self {
        let matcher = Matcher::new(store.clone(), config.recipes.match_threshold)
            .with_tie_break(config.recipes.tie_break);
        let learner = Arc::new(Learner::new(
            Generalizer::new(llm),
            store.clone(),
            config.recipes.enabled,
        ));
        let replay = ReplayExecutor::new(store.clone(), api, config.recipes.replay_concurrency)
            .with_budget(preview_budget(&config));
        Self {
            config,
            store,
            matcher,
            learner,
            replay,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<RecipeStore> {
        &self.store
    }

    pub fn learner(&self) -> &Arc<Learner> {
        &self.learner
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn replay_executor(&self) -> &ReplayExecutor {
        &self.replay
    }

    /// 推理引擎提示词用的候选 recipe
    pub fn suggest(&self, key: &CacheKey, question: &str) -> Vec<Suggestion> {
        self.matcher
            .suggest(key, question, self.config.recipes.suggest_limit)
    }

    /// 取消全部后台学习任务
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 回答一个问题
    pub async fn answer(
        &self,
        question: &str,
        key: &CacheKey,
        params: &Map<String, Value>,
        live: &dyn LiveReasoner,
    ) -> Result<Answer, AnswerError> {
        self.answer_with_cancel(question, key, params, live, &CancellationToken::new())
            .await
    }

    /// 可取消的 answer：取消时回放与实时推理协作退出，不缓存任何东西
    pub async fn answer_with_cancel(
        &self,
        question: &str,
        key: &CacheKey,
        params: &Map<String, Value>,
        live: &dyn LiveReasoner,
        cancel: &CancellationToken,
    ) -> Result<Answer, AnswerError> {
        let mut lifecycle = QuestionLifecycle::new();
        advance(&mut lifecycle, QuestionPhase::Matching);

        let hit = if self.config.recipes.enabled {
            self.matcher.find(key, question)
        } else {
            None
        };

        if let Some(recipe) = hit {
            advance(&mut lifecycle, QuestionPhase::Hit);
            advance(&mut lifecycle, QuestionPhase::Replaying);
            match self.replay.replay_for(key, &recipe, params, cancel).await {
                Ok(output) => {
                    advance(&mut lifecycle, QuestionPhase::Succeeded);
                    return Ok(Answer {
                        output,
                        source: AnswerSource::Replayed {
                            recipe_id: recipe.id().to_string(),
                        },
                        lifecycle,
                        learning: None,
                    });
                }
                Err(ReplayError::Cancelled) => {
                    advance(&mut lifecycle, QuestionPhase::Failed);
                    return Err(AnswerError::Cancelled);
                }
                Err(e) if e.is_fallback() => {
                    tracing::info!(recipe_id = %recipe.id(), error = %e, "replay failed, falling back to live reasoning");
                }
                Err(e) => {
                    advance(&mut lifecycle, QuestionPhase::Failed);
                    return Err(e.into());
                }
            }
        } else {
            advance(&mut lifecycle, QuestionPhase::Miss);
        }

        advance(&mut lifecycle, QuestionPhase::LiveReasoning);
        self.answer_live(question, key, live, cancel, lifecycle).await
    }

    async fn answer_live(
        &self,
        question: &str,
        key: &CacheKey,
        live: &dyn LiveReasoner,
        cancel: &CancellationToken,
        mut lifecycle: QuestionLifecycle,
    ) -> Result<Answer, AnswerError> {
        let mut ctx = ExecutionContext::with_budget(preview_budget(&self.config))?;
        let mut recorder = TraceRecorder::new();

        let run = tokio::select! {
            _ = cancel.cancelled() => Err(AnswerError::Cancelled),
            r = live.run(question, &mut ctx, &mut recorder) => r.map_err(AnswerError::from),
        };
        if let Err(e) = run {
            advance(&mut lifecycle, QuestionPhase::Failed);
            return Err(e);
        }

        let (trace, learnable) = match recorder.finish(question, key.clone()) {
            Ok(trace) => (trace, true),
            Err((trace, reason)) => {
                tracing::info!(reason = %reason, "skipping recipe learning");
                (trace, false)
            }
        };
        let output = RunOutput::from_trace(&trace, &ctx);
        advance(&mut lifecycle, QuestionPhase::Succeeded);

        let learning = (learnable && self.config.recipes.enabled && !cancel.is_cancelled()).then(|| {
            advance(&mut lifecycle, QuestionPhase::Generalizing);
            self.spawn_learning(trace)
        });

        Ok(Answer {
            output,
            source: AnswerSource::Live,
            lifecycle,
            learning,
        })
    }

    /// 在后台任务中学习；失败只记日志。引擎 shutdown 时取消，取消后不缓存
    pub fn spawn_learning(&self, trace: Trace) -> JoinHandle<Result<PutOutcome, LearnError>> {
        let learner = self.learner.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(LearnError::Cancelled),
                r = learner.learn(&trace) => r,
            };
            match &result {
                Ok(outcome) if outcome.skipped => {
                    tracing::debug!(recipe_id = %outcome.id, "recipe already cached")
                }
                Ok(outcome) => tracing::info!(recipe_id = %outcome.id, name = %outcome.name, "recipe learned"),
                Err(e @ (LearnError::Disabled | LearnError::Skipped(_) | LearnError::Cancelled)) => {
                    tracing::debug!(error = %e, "recipe learning skipped")
                }
                Err(e) => tracing::warn!(error = %e, question = %trace.question(), "recipe learning failed"),
            }
            result
        })
    }
}

fn preview_budget(config: &AppConfig) -> PreviewBudget {
    PreviewBudget::new(
        config.context.max_preview_chars,
        config.context.max_preview_rows,
    )
}

/// 状态机由本模块驱动，转移顺序固定；非法转移只可能是编程错误，记录后忽略
fn advance(lifecycle: &mut QuestionLifecycle, next: QuestionPhase) {
    if let Err(e) = lifecycle.advance(next) {
        tracing::error!(error = %e, "question lifecycle");
    }
}

/// 学习任务结束后的生命周期终态
fn learning_phase(result: &Result<PutOutcome, LearnError>) -> QuestionPhase {
    match result {
        Ok(_) => QuestionPhase::Cached,
        Err(_) => QuestionPhase::DiscardedSilently,
    }
}
