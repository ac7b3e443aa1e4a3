//! Scripted connector
//!
//! Returns a fixed list of hits, optionally paced and optionally failing.
//! Used for local development and as the deterministic backend in tests.

use super::{Connector, HitStream};
use async_trait::async_trait;
use fista_common::config::BackendConfig;
use fista_common::errors::{AppError, Result};
use fista_common::models::BackendHit;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub struct ScriptedConnector {
    name: String,
    hits: Vec<BackendHit>,
    item_delay: Duration,
    open_delay: Duration,
    failures_before_success: u32,
    always_fail: bool,
    trailing_error: bool,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hits: Vec::new(),
            item_delay: Duration::ZERO,
            open_delay: Duration::ZERO,
            failures_before_success: 0,
            always_fail: false,
            trailing_error: false,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let hits = config
            .results
            .iter()
            .map(|r| BackendHit::new(r.content.clone(), r.score))
            .collect();
        Self::new(config.name.clone())
            .with_hits(hits)
            .with_item_delay(Duration::from_millis(config.delay_ms))
    }

    pub fn with_hits(mut self, hits: Vec<BackendHit>) -> Self {
        self.hits = hits;
        self
    }

    /// Wait this long before yielding each hit
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    /// Wait this long before the stream is opened
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Fail the first `n` attempts to open
    pub fn failing(mut self, n: u32) -> Self {
        self.failures_before_success = n;
        self
    }

    /// Fail every attempt to open
    pub fn unavailable(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Yield an error after the last hit
    pub fn with_trailing_error(mut self) -> Self {
        self.trailing_error = true;
        self
    }

    /// Number of times `query` has been called
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, _text: &str, _timeout: Duration) -> Result<HitStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        if self.always_fail || attempt <= self.failures_before_success {
            return Err(AppError::BackendUnavailable {
                backend: self.name.clone(),
                message: format!("scripted failure on attempt {}", attempt),
            });
        }

        let delay = self.item_delay;
        let hits = stream::iter(self.hits.clone()).then(move |hit| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, AppError>(hit)
        });

        if self.trailing_error {
            let backend = self.name.clone();
            let failure = stream::once(async move {
                Err(AppError::BackendUnavailable {
                    backend,
                    message: "stream interrupted".to_string(),
                })
            });
            Ok(hits.chain(failure).boxed())
        } else {
            Ok(hits.boxed())
        }
    }
}
