//! API 身份与 Schema 指纹
//!
//! CacheKey = (api_identity, schema_fingerprint)；指纹变化是唯一的失效信号，旧条目只是不再可达。

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 目标 API 的身份（GraphQL 端点，或 REST 的 spec URL + base URL）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiIdentity(String);

impl ApiIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn graphql(endpoint: &str) -> Self {
        Self(format!("graphql:{endpoint}"))
    }

    pub fn rest(spec_url: &str, base_url: &str) -> Self {
        Self(format!("rest:{spec_url}|{base_url}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 内省 schema 的不透明哈希
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaFingerprint(String);

impl SchemaFingerprint {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 原始 schema 文本的 SHA-256（小写 hex）
pub fn schema_fingerprint(raw_schema: &str) -> SchemaFingerprint {
    let digest = Sha256::digest(raw_schema.as_bytes());
    SchemaFingerprint(hex::encode(digest))
}

/// Recipe Store 的分区键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub api: ApiIdentity,
    pub fingerprint: SchemaFingerprint,
}

impl CacheKey {
    pub fn new(api: ApiIdentity, fingerprint: SchemaFingerprint) -> Self {
        Self { api, fingerprint }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.fingerprint.as_str().chars().take(12).collect();
        write!(f, "{}@{}", self.api, short)
    }
}
