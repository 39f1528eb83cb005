//! 目标 API 客户端
//!
//! GraphQL：POST `{query, variables}` 到端点，响应中的 `errors` 视为失败，返回 `data`。
//! REST：替换路径中的 `{name}`，非 null 的 query 参数拼到查询串；只读模式下非 GET 方法
//! 仅在路径命中 allow 模式时放行。日志只记录 header 名，不记录值。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use serde_json::{json, Map, Value};

use crate::config::ApiSection;
use crate::core::ApiError;
use crate::trace::ApiRequest;

/// 错误响应体保留的最大字符数
const ERROR_BODY_MAX_CHARS: usize = 500;

/// 目标 API 执行器：Replay Executor 与实时推理共用
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// 基于 reqwest 的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    client: Client,
    graphql_endpoint: Option<String>,
    base_url: Option<String>,
    headers: HeaderMap,
    allow_unsafe_paths: Vec<String>,
}

impl HttpApiClient {
    fn build(cfg: &ApiSection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            graphql_endpoint: None,
            base_url: None,
            headers: HeaderMap::new(),
            allow_unsafe_paths: cfg.allow_unsafe_paths.clone(),
        }
    }

    pub fn graphql(endpoint: impl Into<String>, cfg: &ApiSection) -> Self {
        let mut c = Self::build(cfg);
        c.graphql_endpoint = Some(endpoint.into());
        c
    }

    pub fn rest(base_url: impl Into<String>, cfg: &ApiSection) -> Self {
        let mut c = Self::build(cfg);
        c.base_url = Some(base_url.into());
        c
    }

    /// 转发的请求头（如 Authorization）；名称或值非法时返回 InvalidRequest
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ApiError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::InvalidRequest(format!("header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    fn header_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.headers.keys().map(HeaderName::as_str).collect();
        keys.sort_unstable();
        keys
    }

    async fn execute_graphql(&self, query: &str, variables: Option<&Value>) -> Result<Value, ApiError> {
        let endpoint = self
            .graphql_endpoint
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("No GraphQL endpoint configured".into()))?;
        tracing::info!(endpoint = %endpoint, header_keys = ?self.header_keys(), "GraphQL request");

        let resp = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json")
            .json(&json!({ "query": query, "variables": variables.cloned().unwrap_or(Value::Null) }))
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_body(resp).await?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(ApiError::GraphQl(truncate(&Value::Array(errors.clone()).to_string())));
            }
        }
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    async fn execute_rest(
        &self,
        method: &str,
        path: &str,
        path_params: &Map<String, Value>,
        query_params: &Map<String, Value>,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let method_upper = method.to_uppercase();
        if method_upper != "GET" && !path_allowed(path, &self.allow_unsafe_paths) {
            return Err(ApiError::MethodNotAllowed(method_upper));
        }
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("No base URL provided".into()))?;
        let url = build_url(base_url, path, path_params);
        let method = Method::from_bytes(method_upper.as_bytes())
            .map_err(|_| ApiError::InvalidRequest(format!("Unsupported method: {method_upper}")))?;
        let query: Vec<(String, String)> = query_params
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), value_as_text(v)))
            .collect();

        tracing::info!(
            method = %method,
            path = %path,
            url = %url,
            header_keys = ?self.header_keys(),
            "REST request resolved"
        );

        let mut req = self
            .client
            .request(method.clone(), &url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json")
            .query(&query);
        if method != Method::GET {
            if let Some(b) = body {
                req = req.header(CONTENT_TYPE, "application/json").json(b);
            }
        }
        let resp = req.send().await.map_err(transport_error)?;
        read_body(resp).await
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        match request {
            ApiRequest::Graphql { query, variables } => self.execute_graphql(query, variables.as_ref()).await,
            ApiRequest::Rest {
                method,
                path,
                path_params,
                query_params,
                body,
            } => {
                self.execute_rest(method, path, path_params, query_params, body.as_ref())
                    .await
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(e.to_string())
    }
}

/// 非 2xx 映射为 Status；JSON 响应解析，其余以字符串返回
async fn read_body(resp: Response) -> Result<Value, ApiError> {
    let status = resp.status();
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);
    let text = resp.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body: truncate(&text),
        });
    }
    if is_json {
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    } else {
        Ok(Value::String(text))
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(ERROR_BODY_MAX_CHARS).collect()
}

/// 路径参数与 query 参数的文本形式：字符串不带引号
fn value_as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_url(base_url: &str, path: &str, path_params: &Map<String, Value>) -> String {
    let mut path = path.to_string();
    for (key, value) in path_params {
        path = path.replace(&format!("{{{key}}}"), &value_as_text(value));
    }
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// `*` 通配的路径模式匹配
pub fn path_allowed(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        let re = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        regex::Regex::new(&re)
            .map(|r| r.is_match(path))
            .unwrap_or(false)
    })
}
