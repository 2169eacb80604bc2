//! HTTP blob store
//!
//! Uploads with `PUT {base_url}/{path}` and a bearer token. The store answers
//! with `{"url": "..."}`; when it does not, the public URL is built from
//! `public_base_url`.

use crate::comfy::DEFAULT_CONTROL_TIMEOUT;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use kiln_core::{KilnError, ObjectStorage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Blob store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    /// Upload endpoint
    pub base_url: String,

    /// Bearer token for uploads
    pub token: String,

    /// Prefix for public URLs when the store does not return one
    #[serde(default)]
    pub public_base_url: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_CONTROL_TIMEOUT
}

impl BlobStoreConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            public_base_url: None,
            timeout: default_timeout(),
        }
    }

    /// Set public URL prefix
    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    url: String,
}

/// Object storage over plain HTTP
pub struct HttpBlobStore {
    config: BlobStoreConfig,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(config: BlobStoreConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(OrchestratorError::config("blob store token is empty"));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let path = path.trim_start_matches('/');
        let url = format!("{}/{}", self.config.base_url, path);
        let size = bytes.len();
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(OrchestratorError::api(status, text));
        }

        let public = match serde_json::from_str::<PutResponse>(&text) {
            Ok(parsed) => parsed.url,
            Err(_) => {
                let base = self
                    .config
                    .public_base_url
                    .as_deref()
                    .unwrap_or(&self.config.base_url);
                format!("{}/{}", base, path)
            }
        };
        debug!(path, size, url = %public, "Uploaded blob");
        Ok(public)
    }
}

#[async_trait]
impl ObjectStorage for HttpBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> kiln_core::Result<String> {
        self.upload(path, bytes, content_type)
            .await
            .map_err(|e| KilnError::storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::put;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_store() -> String {
        let router = Router::new().route(
            "/{*path}",
            put(|Path(path): Path<String>, headers: HeaderMap, body: Bytes| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer tok");
                if !authorized {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                if path.starts_with("plain/") {
                    return (StatusCode::CREATED, "stored").into_response();
                }
                Json(json!({ "url": format!("https://cdn.example/{}?n={}", path, body.len()) }))
                    .into_response()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_put_returns_store_url() {
        let store = HttpBlobStore::new(BlobStoreConfig::new(spawn_store().await, "tok")).unwrap();
        let url = store
            .put("jobs/abc/raw.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/jobs/abc/raw.png?n=3");
    }

    #[tokio::test]
    async fn test_put_falls_back_to_public_base() {
        let config = BlobStoreConfig::new(spawn_store().await, "tok")
            .with_public_base_url("https://public.example/");
        let store = HttpBlobStore::new(config).unwrap();
        let url = store.put("/plain/x.png", vec![0], "image/png").await.unwrap();
        assert_eq!(url, "https://public.example/plain/x.png");
    }

    #[tokio::test]
    async fn test_rejected_upload_is_storage_error() {
        let store = HttpBlobStore::new(BlobStoreConfig::new(spawn_store().await, "wrong")).unwrap();
        let err = store.put("jobs/a.png", vec![0], "image/png").await.unwrap_err();
        assert!(matches!(err, KilnError::Storage(_)));
    }
}
