//! Trace 步骤：API 调用或后处理查询（带标签的枚举，结构比较可穷尽）

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 目标 API 协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Graphql,
    Rest,
}

/// 具体请求参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ApiRequest {
    Graphql {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Value>,
    },
    Rest {
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        path_params: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        query_params: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl ApiRequest {
    pub fn graphql(query: impl Into<String>) -> Self {
        ApiRequest::Graphql {
            query: query.into(),
            variables: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest::Rest {
            method: "GET".to_string(),
            path: path.into(),
            path_params: Map::new(),
            query_params: Map::new(),
            body: None,
        }
    }

    /// 追加 query 参数（仅 REST）
    pub fn with_query_param(mut self, key: &str, value: Value) -> Self {
        if let ApiRequest::Rest { query_params, .. } = &mut self {
            query_params.insert(key.to_string(), value);
        }
        self
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ApiRequest::Graphql { .. } => Protocol::Graphql,
            ApiRequest::Rest { .. } => Protocol::Rest,
        }
    }

    /// 调用目标：REST 为 "METHOD /path"，GraphQL 为 "graphql"
    pub fn target(&self) -> String {
        match self {
            ApiRequest::Graphql { .. } => "graphql".to_string(),
            ApiRequest::Rest { method, path, .. } => format!("{} {}", method.to_uppercase(), path),
        }
    }
}

/// 一次 API 调用，结果登记为 output 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallStep {
    pub request: ApiRequest,
    pub output: String,
}

/// 针对具名表的 SQL 查询，结果登记为 output 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStep {
    pub sql: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    ApiCall(ApiCallStep),
    Query(QueryStep),
}

impl Step {
    pub fn api_call(request: ApiRequest, output: impl Into<String>) -> Self {
        Step::ApiCall(ApiCallStep {
            request,
            output: output.into(),
        })
    }

    pub fn query(sql: impl Into<String>, output: impl Into<String>) -> Self {
        Step::Query(QueryStep {
            sql: sql.into(),
            output: output.into(),
        })
    }

    pub fn output(&self) -> &str {
        match self {
            Step::ApiCall(s) => &s.output,
            Step::Query(s) => &s.output,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::ApiCall(_) => "api_call",
            Step::Query(_) => "query",
        }
    }
}
