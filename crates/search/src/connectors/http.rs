//! HTTP search API connector
//!
//! Sends `{"query", "limit"}` as JSON and expects
//! `{"results": [{"content", "score", "title"?, "url"?}]}` back.

use super::{Connector, HitStream};
use async_trait::async_trait;
use fista_common::config::BackendConfig;
use fista_common::errors::{AppError, Result};
use fista_common::models::BackendHit;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct SearchApiRequest<'a> {
    query: &'a str,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchApiResponse {
    #[serde(default)]
    results: Vec<BackendHit>,
}

pub struct HttpConnector {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_results: usize,
}

impl HttpConnector {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        max_results: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            name: name.into(),
            client,
            endpoint: endpoint.into(),
            api_key,
            max_results,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| AppError::Configuration {
            message: format!("backend '{}': http connectors require an endpoint", config.name),
        })?;
        Self::new(
            config.name.clone(),
            endpoint,
            config.api_key.clone(),
            config.max_results,
        )
    }

    fn unavailable(&self, message: String) -> AppError {
        AppError::BackendUnavailable {
            backend: self.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, text: &str, timeout: Duration) -> Result<HitStream> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&SearchApiRequest {
                query: text,
                limit: self.max_results,
            });

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.unavailable(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("API error {}: {}", status, body)));
        }

        let parsed: SearchApiResponse = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("Failed to parse response: {}", e)))?;

        let mut hits = parsed.results;
        hits.truncate(self.max_results);
        Ok(stream::iter(hits.into_iter().map(Ok::<_, AppError>)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/search", addr)
    }

    #[tokio::test]
    async fn test_parses_results() {
        let app = Router::new().route(
            "/search",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["query"], "best hiking trails");
                assert_eq!(body["limit"], 2);
                Json(serde_json::json!({
                    "results": [
                        { "content": "trail A", "score": 0.9, "url": "https://example.org/a" },
                        { "content": "trail B", "score": 0.7 },
                        { "content": "trail C", "score": 0.5 }
                    ]
                }))
            }),
        );
        let endpoint = serve(app).await;

        let connector = HttpConnector::new("web", endpoint, None, 2).unwrap();
        let hits: Vec<_> = connector
            .query("best hiking trails", Duration::from_secs(5))
            .await
            .unwrap()
            .map(|h| h.unwrap())
            .collect()
            .await;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "trail A");
        assert_eq!(hits[0].url.as_deref(), Some("https://example.org/a"));
        assert_eq!(hits[1].score, 0.7);
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let app = Router::new().route(
            "/search",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let endpoint = serve(app).await;

        let connector = HttpConnector::new("web", endpoint, None, 10).unwrap();
        let err = match connector.query("trails", Duration::from_secs(5)).await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        match err {
            AppError::BackendUnavailable { backend, message } => {
                assert_eq!(backend, "web");
                assert!(message.contains("503"));
                assert!(message.contains("overloaded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
