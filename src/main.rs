//! api-recipe 命令行：重放录制的 Trace，或从 Trace 学习 recipe 后用默认参数回放
//!
//! 用法：
//! ```bash
//! api-recipe <trace.json> [endpoint]
//! API_RECIPE_LEARN=1 api-recipe <trace.json> [endpoint]
//! ```
//! endpoint 未给出时读取环境变量 API_RECIPE_ENDPOINT；GraphQL Trace 视为端点地址，REST Trace 视为 base URL。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Map;

use api_recipe::api::{ApiClient, HttpApiClient};
use api_recipe::config::load_config;
use api_recipe::core::Learner;
use api_recipe::llm::OpenAiClient;
use api_recipe::observability::init_tracing;
use api_recipe::recipe::{Generalizer, RecipeStore, ReplayExecutor};
use api_recipe::trace::{Protocol, Step, Trace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = load_config(None).context("Failed to load config")?;

    let mut args = std::env::args().skip(1);
    let trace_path = PathBuf::from(
        args.next()
            .context("usage: api-recipe <trace.json> [endpoint]")?,
    );
    let endpoint = args
        .next()
        .or_else(|| std::env::var("API_RECIPE_ENDPOINT").ok())
        .context("endpoint not given (argument or API_RECIPE_ENDPOINT)")?;

    let raw = std::fs::read_to_string(&trace_path)
        .with_context(|| format!("Failed to read {}", trace_path.display()))?;
    let trace: Trace = serde_json::from_str(&raw).context("Invalid trace JSON")?;

    let graphql = trace.steps().iter().any(|s| {
        matches!(s, Step::ApiCall(call) if call.request.protocol() == Protocol::Graphql)
    });
    let api: Arc<dyn ApiClient> = if graphql {
        Arc::new(HttpApiClient::graphql(endpoint, &cfg.api))
    } else {
        Arc::new(HttpApiClient::rest(endpoint, &cfg.api))
    };

    let store = Arc::new(RecipeStore::new(cfg.recipes.cache_size));
    let executor = ReplayExecutor::new(store.clone(), api, cfg.recipes.replay_concurrency);

    let output = if std::env::var("API_RECIPE_LEARN").is_ok() {
        let llm = Arc::new(OpenAiClient::from_config(&cfg.llm));
        let learner = Learner::new(Generalizer::new(llm), store.clone(), cfg.recipes.enabled);
        let outcome = learner.learn(&trace).await.context("Recipe learning failed")?;
        let recipe = store
            .get(&outcome.id)
            .context("learned recipe missing from store")?;
        println!("{}", serde_json::to_string_pretty(&recipe.tool_spec())?);
        executor
            .replay(&recipe, &Map::new())
            .await
            .context("Recipe replay failed")?
    } else {
        executor.run_trace(&trace).await.context("Trace replay failed")?
    };

    let preview = output
        .preview
        .as_ref()
        .map(|p| p.to_json())
        .unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}
