//! Recipe 学习与回放集成测试

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use api_recipe::api::{schema_fingerprint, ApiClient, ApiIdentity, CacheKey};
    use api_recipe::config::AppConfig;
    use api_recipe::context::{extract_rows, ExecutionContext};
    use api_recipe::core::{
        AnswerError, ApiError, Learner, LearnError, LiveReasoner, LlmError, QuestionPhase, ReplayError,
        StepFailure,
    };
    use api_recipe::llm::MockLlmClient;
    use api_recipe::recipe::{Generalizer, Matcher, RecipeStore, ReplayExecutor};
    use api_recipe::trace::{ApiRequest, Step, Trace, TraceRecorder};
    use api_recipe::{AnswerSource, RecipeEngine};

    const TOP_USERS_SQL: &str = "SELECT name, age FROM users ORDER BY age DESC LIMIT 5";

    const TOP_USERS_CANDIDATE: &str = r#"{
      "tool_name": "get_top_users_by_age",
      "params": {"limit": {"type": "number", "default": 5}},
      "steps": [
        {"type": "api_call", "output": "users", "request": {"kind": "rest", "method": "GET", "path": "/users"}},
        {"type": "query", "output": "sql_result", "sql": "SELECT name, age FROM users ORDER BY age DESC LIMIT {{limit}}"}
      ]
    }"#;

    /// 按路径返回固定响应的目标 API
    #[derive(Default)]
    struct FakeApi {
        responses: Mutex<HashMap<String, Result<Value, ApiError>>>,
        calls: AtomicUsize,
    }

    impl FakeApi {
        fn with_users(n: usize) -> Self {
            let api = FakeApi::default();
            let users: Vec<Value> = (1..=n)
                .map(|i| json!({"id": i, "name": format!("u{i}"), "age": 20 + i}))
                .collect();
            api.respond("/users", Ok(Value::Array(users)));
            api
        }

        fn respond(&self, path: &str, response: Result<Value, ApiError>) {
            self.responses
                .lock()
                .unwrap()
                .insert(path.to_string(), response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ApiClient for FakeApi {
        async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = match request {
                ApiRequest::Rest { path, .. } => path.clone(),
                ApiRequest::Graphql { .. } => "graphql".to_string(),
            };
            self.responses
                .lock()
                .unwrap()
                .get(&path)
                .cloned()
                .unwrap_or_else(|| Err(ApiError::Status { status: 404, body: path }))
        }
    }

    fn key() -> CacheKey {
        CacheKey::new(
            ApiIdentity::rest("http://api/openapi.json", "http://api"),
            schema_fingerprint("openapi v1"),
        )
    }

    fn top_users_trace() -> Trace {
        Trace::new(
            "Top 5 users by age",
            key(),
            vec![
                Step::api_call(ApiRequest::get("/users"), "users"),
                Step::query(TOP_USERS_SQL, "sql_result"),
            ],
        )
    }

    fn single_call_trace(question: &str, path: &str) -> Trace {
        Trace::new(question, key(), vec![Step::api_call(ApiRequest::get(path), "data")])
    }

    fn single_call_candidate(name: &str, path: &str) -> String {
        json!({
            "tool_name": name,
            "steps": [{"type": "api_call", "output": "data", "request": {"kind": "rest", "method": "GET", "path": path}}]
        })
        .to_string()
    }

    fn learner(llm: Arc<MockLlmClient>, store: Arc<RecipeStore>) -> Learner {
        Learner::new(Generalizer::new(llm), store, true)
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_learn_then_replay_with_new_limit() {
        let store = Arc::new(RecipeStore::new(64));
        let llm = Arc::new(MockLlmClient::with_responses([TOP_USERS_CANDIDATE]));
        let outcome = learner(llm, store.clone())
            .learn(&top_users_trace())
            .await
            .unwrap();
        assert_eq!(outcome.name, "get_top_users_by_age");

        let matcher = Matcher::new(store.clone(), 0.8);
        let recipe = matcher.find(&key(), "top 5 users by age").unwrap();
        assert_eq!(recipe.id(), outcome.id);

        let api = Arc::new(FakeApi::with_users(20));
        let executor = ReplayExecutor::new(store.clone(), api.clone(), 4);
        let output = executor
            .replay(&recipe, &params(json!({"limit": 10})))
            .await
            .unwrap();
        assert_eq!(output.row_count(), 10);
        assert_eq!(
            output.queries,
            vec!["SELECT name, age FROM users ORDER BY age DESC LIMIT 10".to_string()]
        );
        assert_eq!(api.calls(), 1);
        assert_eq!(store.get(recipe.id()).unwrap().use_count(), 1);

        // 默认参数重现原 Trace
        let output = executor.replay(&recipe, &Map::new()).await.unwrap();
        assert_eq!(output.row_count(), 5);
    }

    #[tokio::test]
    async fn test_validator_rejects_mismatched_default() {
        let store = Arc::new(RecipeStore::new(64));
        let wrong_default = TOP_USERS_CANDIDATE.replace("\"default\": 5", "\"default\": 3");
        let llm = Arc::new(MockLlmClient::with_responses([wrong_default]));
        let err = learner(llm, store.clone())
            .learn(&top_users_trace())
            .await
            .unwrap_err();
        assert!(matches!(err, LearnError::ValidationFailure { step: Some(2), .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_generalizer_error_is_learn_failure() {
        let store = Arc::new(RecipeStore::new(64));
        let llm = Arc::new(MockLlmClient::new());
        llm.push_error(LlmError::Timeout);
        let err = learner(llm, store.clone())
            .learn(&top_users_trace())
            .await
            .unwrap_err();
        assert!(matches!(err, LearnError::GeneralizationFailure(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let store = Arc::new(RecipeStore::new(64));
        let responses: Vec<String> = (0..65)
            .map(|i| single_call_candidate(&format!("list_items_{i}"), &format!("/items{i}")))
            .collect();
        let learner = learner(Arc::new(MockLlmClient::with_responses(responses)), store.clone());

        let mut ids = Vec::new();
        for i in 0..65 {
            let trace = single_call_trace(&format!("items group {i}"), &format!("/items{i}"));
            ids.push(learner.learn(&trace).await.unwrap().id);
        }
        assert_eq!(store.len(), 64);
        assert!(store.get(&ids[0]).is_none());
        assert!(store.get(&ids[64]).is_some());
    }

    #[tokio::test]
    async fn test_touch_protects_from_eviction() {
        let store = Arc::new(RecipeStore::new(3));
        let responses: Vec<String> = ["a", "b", "c", "d"]
            .iter()
            .map(|p| single_call_candidate(&format!("list_{p}"), &format!("/{p}")))
            .collect();
        let learner = learner(Arc::new(MockLlmClient::with_responses(responses)), store.clone());

        let mut ids = Vec::new();
        for p in ["a", "b", "c"] {
            let trace = single_call_trace(&format!("list every {p}"), &format!("/{p}"));
            ids.push(learner.learn(&trace).await.unwrap().id);
        }
        assert!(store.touch(&ids[0]));

        let outcome = learner
            .learn(&single_call_trace("list every d", "/d"))
            .await
            .unwrap();
        assert_eq!(outcome.evicted.as_deref(), Some(ids[1].as_str()));
        assert!(store.get(&ids[0]).is_some());
    }

    #[tokio::test]
    async fn test_failure_at_second_step_is_reported() {
        let store = Arc::new(RecipeStore::new(8));
        let candidate = json!({
            "tool_name": "list_users_and_orders",
            "steps": [
                {"type": "api_call", "output": "users", "request": {"kind": "rest", "method": "GET", "path": "/users"}},
                {"type": "api_call", "output": "orders", "request": {"kind": "rest", "method": "GET", "path": "/orders"}}
            ]
        })
        .to_string();
        let trace = Trace::new(
            "users and their orders",
            key(),
            vec![
                Step::api_call(ApiRequest::get("/users"), "users"),
                Step::api_call(ApiRequest::get("/orders"), "orders"),
            ],
        );
        let outcome = learner(Arc::new(MockLlmClient::with_responses([candidate])), store.clone())
            .learn(&trace)
            .await
            .unwrap();

        let api = Arc::new(FakeApi::with_users(3));
        api.respond(
            "/orders",
            Err(ApiError::Status {
                status: 500,
                body: "boom".into(),
            }),
        );
        let recipe = store.get(&outcome.id).unwrap();
        let err = ReplayExecutor::new(store.clone(), api, 4)
            .replay(&recipe, &Map::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReplayError::ReplayExecutionError {
                step: 2,
                cause: StepFailure::Api(ApiError::Status {
                    status: 500,
                    body: "boom".into()
                }),
            }
        );
        assert!(err.is_fallback());
        // 失败的回放不计入使用
        assert_eq!(recipe.use_count(), 0);
    }

    #[tokio::test]
    async fn test_schema_change_makes_recipe_unreachable() {
        let store = Arc::new(RecipeStore::new(8));
        let llm = Arc::new(MockLlmClient::with_responses([TOP_USERS_CANDIDATE]));
        let outcome = learner(llm, store.clone())
            .learn(&top_users_trace())
            .await
            .unwrap();

        let changed = CacheKey::new(
            ApiIdentity::rest("http://api/openapi.json", "http://api"),
            schema_fingerprint("openapi v2"),
        );
        let matcher = Matcher::new(store.clone(), 0.8);
        assert!(matcher.find(&changed, "Top 5 users by age").is_none());

        let recipe = store.get(&outcome.id).unwrap();
        let executor = ReplayExecutor::new(store.clone(), Arc::new(FakeApi::with_users(5)), 2);
        let err = executor
            .replay_for(&changed, &recipe, &Map::new(), &Default::default())
            .await
            .unwrap_err();
        assert_eq!(err, ReplayError::SchemaMismatch);
    }

    #[tokio::test]
    async fn test_recipe_matches_its_own_question() {
        let store = Arc::new(RecipeStore::new(8));
        let llm = Arc::new(MockLlmClient::with_responses([TOP_USERS_CANDIDATE]));
        let outcome = learner(llm, store.clone())
            .learn(&top_users_trace())
            .await
            .unwrap();
        let recipe = store.get(&outcome.id).unwrap();
        let hit = Matcher::new(store.clone(), 0.8)
            .find_scored(&key(), recipe.question())
            .unwrap();
        assert_eq!(hit.recipe.id(), outcome.id);
        assert!((hit.score - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unknown_parameter_is_hard_error() {
        let store = Arc::new(RecipeStore::new(8));
        let llm = Arc::new(MockLlmClient::with_responses([TOP_USERS_CANDIDATE]));
        let outcome = learner(llm, store.clone())
            .learn(&top_users_trace())
            .await
            .unwrap();
        let recipe = store.get(&outcome.id).unwrap();
        let api = Arc::new(FakeApi::with_users(5));
        let err = ReplayExecutor::new(store.clone(), api.clone(), 2)
            .replay(&recipe, &params(json!({"nope": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::BadParameterError(_)));
        assert!(!err.is_fallback());
        assert_eq!(api.calls(), 0);
    }

    /// 实时推理：查询 /users 并取年龄最大的 5 人
    struct TopUsersReasoner {
        api: Arc<FakeApi>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl LiveReasoner for TopUsersReasoner {
        async fn run(
            &self,
            _question: &str,
            ctx: &mut ExecutionContext,
            recorder: &mut TraceRecorder,
        ) -> Result<(), LlmError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let request = ApiRequest::get("/users");
            let data = self
                .api
                .execute(&request)
                .await
                .map_err(|e| LlmError::ApiError(e.to_string()))?;
            ctx.create_table("users", extract_rows(&data))
                .map_err(|e| LlmError::ApiError(e.to_string()))?;
            recorder.record_api_call(request, "users");
            ctx.query_into(TOP_USERS_SQL, "sql_result")
                .map_err(|e| LlmError::ApiError(e.to_string()))?;
            recorder.record_query(TOP_USERS_SQL, "sql_result");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_engine_learns_from_live_answer_then_replays() {
        let api = Arc::new(FakeApi::with_users(20));
        let llm = Arc::new(MockLlmClient::with_responses([TOP_USERS_CANDIDATE]));
        let engine = RecipeEngine::new(AppConfig::default(), llm.clone(), api.clone());
        let live = TopUsersReasoner {
            api: api.clone(),
            runs: AtomicUsize::new(0),
        };

        let mut first = engine
            .answer("Top 5 users by age", &key(), &Map::new(), &live)
            .await
            .unwrap();
        assert_eq!(first.source, AnswerSource::Live);
        assert_eq!(first.output.row_count(), 5);
        let learned = first.wait_learning().await.unwrap().unwrap();
        assert_eq!(first.lifecycle.current(), QuestionPhase::Cached);

        let second = engine
            .answer("top 5 users by age", &key(), &params(json!({"limit": 10})), &live)
            .await
            .unwrap();
        assert_eq!(
            second.source,
            AnswerSource::Replayed {
                recipe_id: learned.id.clone()
            }
        );
        assert_eq!(second.output.row_count(), 10);
        assert!(second.learning.is_none());
        assert_eq!(live.runs.load(Ordering::SeqCst), 1);
        // 只有一次泛化调用，回放不经过推理引擎
        assert_eq!(llm.calls(), 1);

        let err = engine
            .answer("top 5 users by age", &key(), &params(json!({"limit": "many"})), &live)
            .await
            .unwrap_err();
        assert!(matches!(err, AnswerError::Replay(ReplayError::BadParameterError(_))));
    }

    #[tokio::test]
    async fn test_engine_falls_back_to_live_on_replay_failure() {
        let api = Arc::new(FakeApi::with_users(20));
        let llm = Arc::new(MockLlmClient::with_responses([TOP_USERS_CANDIDATE]));
        let engine = RecipeEngine::new(AppConfig::default(), llm.clone(), api.clone());
        engine.learner().learn(&top_users_trace()).await.unwrap();

        api.respond(
            "/users",
            Err(ApiError::Status {
                status: 503,
                body: "unavailable".into(),
            }),
        );
        let live = TopUsersReasoner {
            api: api.clone(),
            runs: AtomicUsize::new(0),
        };
        let err = engine
            .answer("Top 5 users by age", &key(), &Map::new(), &live)
            .await
            .unwrap_err();
        // 回放失败后回退到实时推理，实时推理同样失败
        assert!(matches!(err, AnswerError::Live(_)));
        assert_eq!(live.runs.load(Ordering::SeqCst), 1);
    }
}
