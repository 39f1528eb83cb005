//! api-recipe - API 问答的 Recipe 学习与回放引擎
//!
//! 模块划分：
//! - **api**: 目标 API 身份、schema 指纹与 HTTP 客户端（GraphQL / REST）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 执行上下文（命名表、只读 SQL、预览）
//! - **core**: 错误、问题生命周期、组合根 RecipeEngine
//! - **llm**: 推理引擎客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化与回放审计
//! - **recipe**: 泛化、校验、存储、匹配与回放
//! - **trace**: 推理会话的步骤记录与输出

pub mod api;
pub mod config;
pub mod context;
pub mod core;
pub mod llm;
pub mod observability;
pub mod recipe;
pub mod trace;

pub use crate::core::{Answer, AnswerSource, LiveReasoner, RecipeEngine};
