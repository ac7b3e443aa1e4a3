//! Connector pool
//!
//! Holds every registered backend with its timeout, retry budget and
//! enabled flag. Queries bind a snapshot of connectors at dispatch time, so
//! toggling a backend never disturbs queries already in flight.

use super::{create_connector, Connector, HitStream, RetryPolicy};
use backoff::backoff::Backoff;
use fista_common::config::BackendConfig;
use fista_common::errors::{AppError, Result};
use fista_common::metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Timeout and retry budget declared by a connector
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Budget for one query against the connector. Open attempts, the
    /// backoff between them and reading the stream share a single deadline.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConnectorSettings {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.timeout(), RetryPolicy::from_config(&config.retry))
    }
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), RetryPolicy::default())
    }
}

/// Backend state as reported by the readiness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub enabled: bool,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

struct PoolEntry {
    connector: Arc<dyn Connector>,
    settings: ConnectorSettings,
    enabled: bool,
}

/// A connector bound to one query, independent of later pool changes
#[derive(Clone)]
pub struct BoundConnector {
    connector: Arc<dyn Connector>,
    settings: ConnectorSettings,
}

impl BoundConnector {
    pub fn name(&self) -> &str {
        self.connector.name()
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Deadline of a query starting now
    pub fn deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.settings.timeout
    }

    pub async fn open(&self, text: &str) -> Result<HitStream> {
        self.open_until(text, self.deadline()).await
    }

    /// Open the connector's result stream, retrying until `deadline`.
    ///
    /// Running out of attempts or time yields `BackendUnavailable` for this
    /// source only.
    pub async fn open_until(&self, text: &str, deadline: tokio::time::Instant) -> Result<HitStream> {
        let name = self.name().to_string();
        let timeout = self.settings.timeout;
        let max_attempts = self.settings.retry.max_attempts;
        let mut schedule = self.settings.retry.schedule();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let start = Instant::now();

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let outcome = match tokio::time::timeout_at(deadline, self.connector.query(text, remaining)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::BackendUnavailable {
                    backend: name.clone(),
                    message: format!("timed out after {}ms", timeout.as_millis()),
                }),
            };

            metrics::record_backend_attempt(&name, start.elapsed().as_secs_f64(), outcome.is_ok());

            let error = match outcome {
                Ok(hits) => {
                    debug!(backend = %name, attempt, "Backend stream opened");
                    return Ok(hits);
                }
                Err(e) => e,
            };

            let reason = match error {
                AppError::BackendUnavailable { message, .. } => message,
                other => other.to_string(),
            };

            let delay = schedule.next_backoff().unwrap_or(self.settings.retry.max_delay);
            if attempt >= max_attempts || tokio::time::Instant::now() + delay >= deadline {
                warn!(
                    backend = %name,
                    attempts = attempt,
                    error = %reason,
                    "Backend exhausted retry budget"
                );
                metrics::record_backend_unavailable(&name);
                return Err(AppError::BackendUnavailable {
                    backend: name,
                    message: reason,
                });
            }

            warn!(
                backend = %name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Backend query failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Registry of backends keyed by name, in registration order
#[derive(Default)]
pub struct ConnectorPool {
    entries: RwLock<Vec<PoolEntry>>,
}

impl ConnectorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from backend configuration
    pub async fn from_config(backends: &[BackendConfig]) -> Result<Self> {
        let pool = Self::new();
        for backend in backends {
            let connector = create_connector(backend)?;
            pool.register(connector, ConnectorSettings::from_config(backend))
                .await?;
            if !backend.enabled {
                pool.disable(&backend.name).await?;
            }
        }
        Ok(pool)
    }

    /// Register a connector, enabled
    pub async fn register(&self, connector: Arc<dyn Connector>, settings: ConnectorSettings) -> Result<()> {
        let mut entries = self.entries.write().await;
        let name = connector.name().to_string();

        if entries.iter().any(|e| e.connector.name() == name) {
            return Err(AppError::Configuration {
                message: format!("backend '{}' is already registered", name),
            });
        }

        info!(
            backend = %name,
            timeout_ms = settings.timeout.as_millis() as u64,
            max_attempts = settings.retry.max_attempts,
            "Backend registered"
        );
        entries.push(PoolEntry {
            connector,
            settings,
            enabled: true,
        });
        Ok(())
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.connector.name() == name)
            .ok_or_else(|| AppError::BackendNotFound {
                name: name.to_string(),
            })?;

        if entry.enabled != enabled {
            entry.enabled = enabled;
            info!(backend = %name, enabled, "Backend toggled");
        }
        Ok(())
    }

    /// Names of backends currently accepting queries
    pub async fn enabled_names(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.connector.name().to_string())
            .collect()
    }

    /// Bind the named backends that are currently enabled
    pub async fn bind(&self, names: &[String]) -> Vec<BoundConnector> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.enabled && names.iter().any(|n| n == e.connector.name()))
            .map(|e| BoundConnector {
                connector: e.connector.clone(),
                settings: e.settings.clone(),
            })
            .collect()
    }

    pub async fn status(&self) -> Vec<BackendStatus> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| BackendStatus {
                name: e.connector.name().to_string(),
                enabled: e.enabled,
                timeout_ms: e.settings.timeout.as_millis() as u64,
                max_attempts: e.settings.retry.max_attempts,
            })
            .collect()
    }
}
