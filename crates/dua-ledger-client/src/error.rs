//! Client error types.

/// Errors that can occur when using the ledger client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The user cannot afford the job.
    #[error("insufficient funds: balance={balance}, required={required}")]
    InsufficientFunds {
        /// Current balance.
        balance: i64,
        /// Units the job costs.
        required: i64,
    },

    /// The provider refused the job. Its reservation was refunded.
    #[error("provider rejected job {job_id}: {message}")]
    ProviderRejected {
        /// The refunded job.
        job_id: String,
        /// Provider message.
        message: String,
    },

    /// The provider could not be reached. The reservation was refunded.
    #[error("provider unavailable for job {job_id}: {message}")]
    ProviderUnavailable {
        /// The refunded job.
        job_id: String,
        /// Last error seen.
        message: String,
    },

    /// Invite code already redeemed.
    #[error("invite already used: {message}")]
    InviteAlreadyUsed {
        /// Server message.
        message: String,
    },

    /// Balance, job or invite not found.
    #[error("not found: {message}")]
    NotFound {
        /// Server message.
        message: String,
    },

    /// Gave up waiting for a job to finish.
    #[error("job {job_id} still running after {attempts} status checks")]
    StillRunning {
        /// The job being waited on.
        job_id: String,
        /// Status checks made.
        attempts: u32,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether the request may succeed if retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            Self::ProviderUnavailable { .. } => true,
            _ => false,
        }
    }
}
