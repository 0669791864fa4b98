//! Service configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use dua_ledger_core::{PricingCatalog, ProviderKind, DEFAULT_INVITE_WELCOME_UNITS};

use crate::providers::{runway, suno};

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// PostgreSQL connection string. When unset the in-memory store is used.
    pub database_url: Option<String>,

    /// Connection pool size.
    pub database_max_connections: u32,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Admin API key for privileged endpoints.
    pub admin_api_key: Option<String>,

    /// JWT issuer base URL; JWKS is fetched from `/.well-known/jwks.json`.
    pub auth_base_url: String,

    /// Expected JWT audience.
    pub auth_audience: String,

    /// Externally reachable base URL used to build provider callback URLs.
    /// Without it jobs are tracked by polling only.
    pub public_base_url: Option<String>,

    /// HMAC secret for callback signatures.
    pub callback_secret: Option<String>,

    /// Suno (kie.ai) music provider.
    pub suno: ProviderSettings,

    /// Runway video provider.
    pub runway: ProviderSettings,

    /// Polling and timeout policy for the job tracker.
    pub tracking: TrackingConfig,

    /// Units credited when an invite code is redeemed.
    pub invite_welcome_units: i64,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Service pricing catalog.
    pub pricing: PricingCatalog,
}

/// Connection settings for one generation provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// API base URL.
    pub api_url: String,
    /// API key. The provider is disabled without one.
    pub api_key: Option<String>,
}

/// Job tracker policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Override for every provider's poll interval.
    pub poll_interval: Option<Duration>,
    /// Wall-clock budget from submission to a terminal state.
    pub job_timeout: Duration,
    /// Maximum status polls per job.
    pub max_poll_attempts: u32,
    /// Timeout for a single status call.
    pub poll_call_timeout: Duration,
    /// Consecutive transient poll failures tolerated before timing out.
    pub transient_retry_cap: u32,
    /// How often the reconciliation sweep runs.
    pub sweep_interval: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval: None,
            job_timeout: Duration::from_secs(600),
            max_poll_attempts: 40,
            poll_call_timeout: Duration::from_secs(15),
            transient_retry_cap: 3,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Provider secrets file structure.
#[derive(Debug, Deserialize)]
struct ProviderSecrets {
    api_key: String,
    #[serde(default)]
    api_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = TrackingConfig::default();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL").ok(),
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            auth_base_url: std::env::var("AUTH_BASE_URL")
                .unwrap_or_else(|_| "https://auth.dua.local".into()),
            auth_audience: std::env::var("AUTH_AUDIENCE").unwrap_or_else(|_| "dua-ledger".into()),
            public_base_url: std::env::var("PUBLIC_BASE_URL").ok(),
            callback_secret: std::env::var("CALLBACK_SECRET").ok(),
            suno: load_provider_settings("suno", suno::DEFAULT_BASE_URL),
            runway: load_provider_settings("runway", runway::DEFAULT_BASE_URL),
            tracking: TrackingConfig {
                poll_interval: std::env::var("POLL_INTERVAL_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .map(Duration::from_secs),
                job_timeout: Duration::from_secs(env_or(
                    "JOB_TIMEOUT_SECONDS",
                    defaults.job_timeout.as_secs(),
                )),
                max_poll_attempts: env_or("MAX_POLL_ATTEMPTS", defaults.max_poll_attempts),
                poll_call_timeout: Duration::from_secs(env_or(
                    "POLL_CALL_TIMEOUT_SECONDS",
                    defaults.poll_call_timeout.as_secs(),
                )),
                transient_retry_cap: env_or("TRANSIENT_RETRY_CAP", defaults.transient_retry_cap),
                sweep_interval: Duration::from_secs(env_or(
                    "SWEEP_INTERVAL_SECONDS",
                    defaults.sweep_interval.as_secs(),
                )),
            },
            invite_welcome_units: env_or("INVITE_WELCOME_UNITS", DEFAULT_INVITE_WELCOME_UNITS),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_or("MAX_BODY_BYTES", 1024 * 1024),
            request_timeout_seconds: env_or("REQUEST_TIMEOUT_SECONDS", 30),
            pricing: PricingCatalog::default(),
        }
    }

    /// Settings for one provider.
    #[must_use]
    pub const fn provider(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::Suno => &self.suno,
            ProviderKind::Runway => &self.runway,
        }
    }

    /// Callback URL handed to `provider`, if callbacks can reach us.
    #[must_use]
    pub fn callback_url(&self, provider: ProviderKind) -> Option<String> {
        self.public_base_url
            .as_deref()
            .map(|base| format!("{}/webhooks/{provider}", base.trim_end_matches('/')))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: None,
            database_max_connections: 10,
            service_api_key: None,
            admin_api_key: None,
            auth_base_url: "https://auth.dua.local".into(),
            auth_audience: "dua-ledger".into(),
            public_base_url: None,
            callback_secret: None,
            suno: ProviderSettings {
                api_url: suno::DEFAULT_BASE_URL.into(),
                api_key: None,
            },
            runway: ProviderSettings {
                api_url: runway::DEFAULT_BASE_URL.into(),
                api_key: None,
            },
            tracking: TrackingConfig::default(),
            invite_welcome_units: DEFAULT_INVITE_WELCOME_UNITS,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            pricing: PricingCatalog::default(),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or
/// malformed.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Load provider settings from a secrets file or the environment.
///
/// Looks for `.secrets/<name>.json` first, then `<NAME>_API_KEY` and
/// `<NAME>_API_URL`.
fn load_provider_settings(name: &str, default_url: &str) -> ProviderSettings {
    let secret_paths = [
        format!(".secrets/{name}.json"),
        format!("../.secrets/{name}.json"),
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<ProviderSecrets>(path) {
            tracing::info!(path = %path, provider = %name, "Loaded provider secrets from file");
            return ProviderSettings {
                api_url: secrets.api_url.unwrap_or_else(|| default_url.to_string()),
                api_key: Some(secrets.api_key),
            };
        }
    }

    tracing::debug!(provider = %name, "Secrets file not found, using environment variables");
    let prefix = name.to_ascii_uppercase();
    ProviderSettings {
        api_url: std::env::var(format!("{prefix}_API_URL"))
            .unwrap_or_else(|_| default_url.to_string()),
        api_key: std::env::var(format!("{prefix}_API_KEY")).ok(),
    }
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<T, std::io::Error> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
