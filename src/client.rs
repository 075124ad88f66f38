//! HTTP client for a running kvpipe server

use crate::common::Result;
use serde_json::{json, Value};
use std::time::Duration;

/// Status code and decoded body of one call
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct KvClient {
    base_url: String,
    http: reqwest::Client,
}

impl KvClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, key: &str) -> Result<ApiResponse> {
        let request = self.http.get(self.url("/kv")).query(&[("key", key)]);
        Self::send(request).await
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<ApiResponse> {
        let request = self
            .http
            .put(self.url("/kv"))
            .json(&json!({ "data": { "key": key, "value": value } }));
        Self::send(request).await
    }

    pub async fn delete(&self, key: &str) -> Result<ApiResponse> {
        let request = self.http.delete(self.url("/kv")).query(&[("key", key)]);
        Self::send(request).await
    }

    pub async fn health(&self) -> Result<ApiResponse> {
        Self::send(self.http.get(self.url("/health"))).await
    }

    pub async fn ready(&self) -> Result<ApiResponse> {
        Self::send(self.http.get(self.url("/health/ready"))).await
    }

    pub async fn cache_stats(&self) -> Result<ApiResponse> {
        Self::send(self.http.get(self.url("/cache/stats"))).await
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<ApiResponse> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        // non-JSON bodies (e.g. a proxy error page) are kept as a string
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(ApiResponse { status, body })
    }
}
