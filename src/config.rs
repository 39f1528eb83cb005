//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `API_RECIPE__*` 覆盖（双下划线表示嵌套，如 `API_RECIPE__RECIPES__CACHE_SIZE=128`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::recipe::TieBreak;

/// 环境变量前缀
const ENV_PREFIX: &str = "API_RECIPE";

/// 配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub recipes: RecipeSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [recipes] 段：缓存开关、容量、匹配阈值、回放并发
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// LRU 容量（进程内全部 API 共享）
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// 模糊匹配阈值（0~1）
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    /// 同分时的优先顺序："use_count"（先比使用次数再比最近使用）或 "recency"
    #[serde(default)]
    pub tie_break: TieBreak,
    /// 提供给推理引擎的候选 recipe 数
    #[serde(default = "default_suggest_limit")]
    pub suggest_limit: usize,
    /// 回放时无依赖 API 步骤的最大并发数
    #[serde(default = "default_replay_concurrency")]
    pub replay_concurrency: usize,
}

impl Default for RecipeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size: default_cache_size(),
            match_threshold: default_match_threshold(),
            tie_break: TieBreak::default(),
            suggest_limit: default_suggest_limit(),
            replay_concurrency: default_replay_concurrency(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    64
}

fn default_match_threshold() -> f64 {
    0.8
}

fn default_suggest_limit() -> usize {
    3
}

fn default_replay_concurrency() -> usize {
    4
}

/// [context] 段：表预览的行数与字符预算
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_preview_rows")]
    pub max_preview_rows: usize,
    /// 约 8K token
    #[serde(default = "default_max_preview_chars")]
    pub max_preview_chars: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_preview_rows: default_max_preview_rows(),
            max_preview_chars: default_max_preview_chars(),
        }
    }
}

fn default_max_preview_rows() -> usize {
    10
}

fn default_max_preview_chars() -> usize {
    32_000
}

/// [api] 段：目标 API 请求超时与非只读路径白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 允许非 GET 方法的路径模式（仅支持 `*` 通配）
    #[serde(default)]
    pub allow_unsafe_paths: Vec<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            allow_unsafe_paths: Vec::new(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// [llm] 段：Recipe 提取所用模型与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_llm_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_llm_request_timeout(),
        }
    }
}

fn default_llm_request_timeout() -> u64 {
    60
}

/// 从 config 目录加载配置，环境变量 API_RECIPE__* 可覆盖
///
/// 1. config/default.toml、../config/default.toml、default.toml 中第一个存在的文件
/// 2. config_path（存在时），覆盖前者
/// 3. 最后叠加环境变量 API_RECIPE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let base = ["config/default", "../config/default", "default"]
        .into_iter()
        .find(|stem| Path::new(&format!("{stem}.toml")).exists());
    if let Some(stem) = base {
        builder = builder.add_source(config::File::with_name(stem).required(false));
    }

    if let Some(extra) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(extra).required(false));
    }

    builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建 RecipeEngine）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
