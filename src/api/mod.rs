//! 目标 API：身份、Schema 指纹与 HTTP 客户端

pub mod client;
pub mod identity;

pub use client::{path_allowed, ApiClient, HttpApiClient};
pub use identity::{schema_fingerprint, ApiIdentity, CacheKey, SchemaFingerprint};
