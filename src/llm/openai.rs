//! OpenAI 兼容 API 客户端
//!
//! async_openai 调用任意 OpenAI 兼容端点（base_url 可配置），作为 Generalizer 的默认推理后端。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::core::LlmError;
use crate::llm::{LlmClient, Message, Role};

/// 累计 token 用量
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    fn record(&self, prompt: u32, completion: u32) {
        self.prompt.fetch_add(u64::from(prompt), Ordering::Relaxed);
        self.completion.fetch_add(u64::from(completion), Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI 兼容端点上的推理引擎；模板提取要求确定性输出，温度固定为 0
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 缺省时读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let mut config = OpenAIConfig::new().with_api_key(key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            usage: TokenUsage::default(),
        }
    }

    pub fn from_config(cfg: &LlmSection) -> Self {
        Self::new(cfg.base_url.as_deref(), &cfg.model, cfg.api_key.as_deref())
            .with_timeout(Duration::from_secs(cfg.timeouts.request))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_request_message(m: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
    let content = m.content.clone();
    let built: Result<ChatCompletionRequestMessage, _> = match m.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(Into::into),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(Into::into),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map(Into::into),
    };
    built.map_err(|e| LlmError::ApiError(e.to_string()))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.0)
            .messages(messages)
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let started = std::time::Instant::now();
        let response = match tokio::time::timeout(self.timeout, self.client.chat().create(request)).await {
            Ok(r) => r.map_err(|e| LlmError::ApiError(e.to_string()))?,
            Err(_) => {
                tracing::warn!(model = %self.model, timeout_secs = self.timeout.as_secs(), "llm request timed out");
                return Err(LlmError::Timeout);
            }
        };
        if let Some(usage) = &response.usage {
            self.usage.record(usage.prompt_tokens, usage.completion_tokens);
        }
        tracing::debug!(
            model = %self.model,
            duration_ms = started.elapsed().as_millis() as u64,
            "llm completion"
        );

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.snapshot()
    }
}
