//! Backend connectors
//!
//! Every search or retrieval backend is reached through the same capability:
//! - `query(text, timeout)` opens a finite, non-restartable stream of hits
//! - the pool wraps each connector with its own timeout and retry budget
//! - connectors are built from configuration by kind (http, knowledge base, scripted)

mod http;
mod knowledge_base;
mod pool;
mod retry;
mod scripted;

pub use http::HttpConnector;
pub use knowledge_base::{Document, KnowledgeBaseConnector};
pub use pool::{BackendStatus, BoundConnector, ConnectorPool, ConnectorSettings};
pub use retry::RetryPolicy;
pub use scripted::ScriptedConnector;

use async_trait::async_trait;
use fista_common::config::{BackendConfig, ConnectorKind};
use fista_common::errors::Result;
use fista_common::models::BackendHit;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Lazily produced hits; ends when the backend has nothing more to return
pub type HitStream = BoxStream<'static, Result<BackendHit>>;

/// Uniform query capability over one concrete backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name, used as the source identifier of its results
    fn name(&self) -> &str;

    /// Open a result stream for `text`; `timeout` is the backend's own budget
    async fn query(&self, text: &str, timeout: Duration) -> Result<HitStream>;
}

/// Create a connector based on configuration
pub fn create_connector(config: &BackendConfig) -> Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match config.kind {
        ConnectorKind::Http => Arc::new(HttpConnector::from_config(config)?),
        ConnectorKind::KnowledgeBase => Arc::new(KnowledgeBaseConnector::from_config(config)),
        ConnectorKind::Scripted => Arc::new(ScriptedConnector::from_config(config)),
    };
    Ok(connector)
}
