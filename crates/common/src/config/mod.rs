//! Configuration management for Fista services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Query normalization limits
    #[serde(default)]
    pub query: QueryConfig,

    /// Task lifecycle configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Conversation store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Search backends, registered in order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum accepted request body for a query, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Maximum canonical query length in characters
    #[serde(default = "default_max_query_length")]
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Overall task timeout in milliseconds, independent of connector timeouts
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,

    /// Buffer between the aggregation engine and the owning task
    #[serde(default = "default_delta_buffer")]
    pub delta_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Maximum number of conversations kept in memory
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,

    /// Conversations idle for longer than this are evicted
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Interval between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Messages retained per conversation
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Agent greeting seeded into new conversations
    #[serde(default)]
    pub greeting: Option<String>,
}

/// Connector implementation backing a configured backend
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// JSON search API over HTTP
    Http,
    /// In-process document set scored by term overlap
    KnowledgeBase,
    /// Fixed results, for local development
    Scripted,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend name, used as the result source identifier
    pub name: String,

    /// Connector implementation
    pub kind: ConnectorKind,

    /// Whether the backend receives queries at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-query timeout in milliseconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_ms: u64,

    /// Maximum results requested from the backend
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Search endpoint (http)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bearer token sent to the endpoint (http)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Indexed documents (knowledge_base)
    #[serde(default)]
    pub documents: Vec<DocumentConfig>,

    /// Canned results (scripted)
    #[serde(default)]
    pub results: Vec<ScriptedResultConfig>,

    /// Delay before each scripted result, in milliseconds (scripted)
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptedResultConfig {
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Exponential growth factor
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    /// Upper bound for a single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Randomization factor in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_body_bytes() -> usize { 64 * 1024 }
fn default_max_query_length() -> usize { 4096 }
fn default_task_timeout() -> u64 { 30_000 }
fn default_delta_buffer() -> usize { 64 }
fn default_max_conversations() -> usize { 1000 }
fn default_idle_ttl() -> u64 { 3600 }
fn default_sweep_interval() -> u64 { 60 }
fn default_max_messages() -> usize { 200 }
fn default_backend_timeout() -> u64 { 5_000 }
fn default_max_results() -> usize { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 200 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 2_000 }
fn default_jitter() -> f64 { 0.5 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "fista".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_query_length(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout(),
            delta_buffer: default_delta_buffer(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_conversations: default_max_conversations(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            max_messages: default_max_messages(),
            greeting: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            query: QueryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            store: StoreConfig::default(),
            backends: Vec::new(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject configurations the runtime cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.max_length == 0 {
            return Err(ConfigError::Message(
                "query.max_length must be greater than zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if backend.retry.max_attempts == 0 {
                return Err(ConfigError::Message(format!(
                    "backend '{}': retry.max_attempts must be at least 1",
                    backend.name
                )));
            }
            if backend.kind == ConnectorKind::Http && backend.endpoint.is_none() {
                return Err(ConfigError::Message(format!(
                    "backend '{}': http connectors require an endpoint",
                    backend.name
                )));
            }
        }
        Ok(())
    }

    /// Get the overall task timeout as Duration
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.task_timeout_ms)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl BackendConfig {
    /// Get the per-query timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl StoreConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
