//! Generation provider adapters.
//!
//! Each adapter turns one provider's HTTP API into the internal vocabulary:
//! a submission returns a [`ProviderJobId`], and status polls and callbacks
//! both produce an [`Observation`]. Nothing outside this module looks at raw
//! provider status strings.

pub mod runway;
pub mod suno;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use dua_ledger_core::{JobId, LedgerError, Observation, ProviderJobId, ProviderKind, ServiceSpec};

use crate::config::ServiceConfig;

pub use runway::RunwayAdapter;
pub use suno::SunoAdapter;

/// Error type for provider calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network failure, timeout, rate limit or maintenance. Worth retrying.
    #[error("provider unavailable: {0}")]
    Transient(String),

    /// The provider refused the request (validation, content policy,
    /// exhausted provider credits).
    #[error("provider rejected request ({code}): {message}")]
    Rejected {
        /// Provider or HTTP status code.
        code: i64,
        /// Provider message.
        message: String,
    },

    /// The HTTP client for the provider could not be built.
    #[error("provider client setup failed: {0}")]
    Client(String),

    /// The adapter does not implement this operation.
    #[error("{provider} does not support {operation}")]
    Unsupported {
        /// Provider.
        provider: ProviderKind,
        /// Operation name.
        operation: &'static str,
    },
}

impl ProviderError {
    /// Whether the failure may go away on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Everything an adapter needs to dispatch one job.
#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    /// Internal job ID, for correlation in provider-side logs.
    pub job_id: JobId,
    /// Catalog entry being purchased.
    pub spec: &'a ServiceSpec,
    /// Caller-supplied generation parameters.
    pub params: &'a Value,
    /// Where the provider should deliver callbacks, if anywhere.
    pub callback_url: Option<String>,
}

/// A generation provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this is.
    fn kind(&self) -> ProviderKind;

    /// Poll interval recommended by the provider.
    fn default_poll_interval(&self) -> Duration;

    /// Whether the provider can deliver status callbacks.
    fn supports_callbacks(&self) -> bool;

    /// Check generation parameters locally, before any credits move.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidParams` describing the first problem.
    fn validate(&self, spec: &ServiceSpec, params: &Value) -> Result<(), LedgerError>;

    /// Dispatch a job and return the provider's task ID.
    async fn submit(&self, request: &SubmitRequest<'_>) -> Result<ProviderJobId, ProviderError>;

    /// Query a task's current status.
    async fn status(&self, provider_job_id: &ProviderJobId) -> Result<Observation, ProviderError>;

    /// Decode a callback body.
    ///
    /// # Errors
    ///
    /// `ProviderError::Unsupported` for providers without callbacks,
    /// `ProviderError::Rejected` for malformed bodies.
    fn parse_callback(&self, body: &Value) -> Result<(ProviderJobId, Observation), ProviderError>;
}

/// The configured adapters, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every provider that has an API key. A provider
    /// whose client cannot be built is left out and logged.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let call_timeout = config.tracking.poll_call_timeout;
        let mut registry = Self::new();

        if let Some(key) = &config.suno.api_key {
            match SunoAdapter::new(&config.suno.api_url, key, call_timeout) {
                Ok(adapter) => {
                    tracing::info!(api_url = %config.suno.api_url, "Suno integration enabled");
                    registry.register(Arc::new(adapter));
                }
                Err(e) => tracing::error!(error = %e, "Suno integration disabled"),
            }
        } else {
            tracing::warn!("Suno not configured - music jobs will be rejected");
        }

        if let Some(key) = &config.runway.api_key {
            match RunwayAdapter::new(&config.runway.api_url, key, call_timeout) {
                Ok(adapter) => {
                    tracing::info!(api_url = %config.runway.api_url, "Runway integration enabled");
                    registry.register(Arc::new(adapter));
                }
                Err(e) => tracing::error!(error = %e, "Runway integration disabled"),
            }
        } else {
            tracing::warn!("Runway not configured - video jobs will be rejected");
        }

        registry
    }

    /// Add or replace an adapter.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for `kind`, if configured.
    #[must_use]
    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Configured providers.
    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.adapters.keys().copied()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

/// Build the shared HTTP client for a provider.
fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Client(e.to_string()))
}

/// Read an optional string parameter.
fn str_param<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Read a required string parameter.
fn required_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, LedgerError> {
    str_param(params, name).ok_or_else(|| LedgerError::InvalidParams(format!("{name} is required")))
}

/// Fail when `value` is longer than `max` characters.
fn check_len(name: &str, value: &str, max: usize) -> Result<(), LedgerError> {
    let len = value.chars().count();
    if len > max {
        return Err(LedgerError::InvalidParams(format!(
            "{name} exceeds maximum of {max} characters ({len})"
        )));
    }
    Ok(())
}
