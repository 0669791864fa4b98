//! Ledger HTTP client implementation.

use reqwest::{Client, RequestBuilder};
use std::time::Duration;

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, Balance, CreateAccountRequest, CreditCheck, CreditStats, DeductRequest,
    Deduction, Job, JobStatus, RedeemInviteRequest, Redemption, ServiceInfo, SubmitJobRequest,
    TransactionPage,
};

/// Ledger API client.
///
/// Covers the service-key API: accounts, balances, history, jobs and invite
/// redemption.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    client: Client,
    base_url: String,
    api_key: String,
    service_name: String,
    job_poll_interval: Duration,
}

impl LedgerClient {
    /// Create a new ledger client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the ledger service (e.g., `"http://dua-ledger:8080"`)
    /// * `api_key` - Service API key for authentication
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a new ledger client with custom options.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            service_name: options.service_name,
            job_poll_interval: options.job_poll_interval,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
    }

    /// Create a user's balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the account already exists.
    pub async fn create_account(
        &self,
        user_id: impl Into<String>,
        initial_units: i64,
    ) -> Result<Balance, ClientError> {
        let request = CreateAccountRequest {
            user_id: user_id.into(),
            initial_units,
        };
        let response = self.post("/v1/accounts").json(&request).send().await?;
        self.handle_response(response).await
    }

    /// Get a user's balance.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotFound` if the user has no balance.
    pub async fn get_balance(&self, user_id: &str) -> Result<Balance, ClientError> {
        let response = self
            .get("/v1/balance")
            .query(&[("userId", user_id)])
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// List a user's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<TransactionPage, ClientError> {
        let response = self
            .get("/v1/transactions")
            .query(&[
                ("userId", user_id.to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// List the service catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>, ClientError> {
        let response = self.get("/v1/services").send().await?;
        self.handle_response(response).await
    }

    /// Submit a generation job. Credits are reserved before the provider is
    /// called.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InsufficientFunds` when the user cannot pay,
    /// `ClientError::ProviderRejected` or `ClientError::ProviderUnavailable`
    /// when dispatch failed and the reservation was refunded.
    pub async fn submit_job(&self, request: SubmitJobRequest) -> Result<Job, ClientError> {
        tracing::debug!(
            user_id = %request.user_id,
            service_type = %request.service_type,
            "Submitting job"
        );
        let response = self.post("/v1/jobs").json(&request).send().await?;
        self.handle_response(response).await
    }

    /// Get a full job record.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotFound` for unknown jobs.
    pub async fn get_job(&self, job_id: &str) -> Result<Job, ClientError> {
        let response = self.get(&format!("/v1/jobs/{job_id}")).send().await?;
        self.handle_response(response).await
    }

    /// Get a job's state.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotFound` for unknown jobs.
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, ClientError> {
        let response = self
            .get(&format!("/v1/jobs/{job_id}/status"))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Wait until a job reaches a terminal state.
    ///
    /// The service tracks the job on its own; this only reads the stored
    /// state every `job_poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::StillRunning` after `max_checks` reads without a
    /// terminal state.
    pub async fn wait_for_job(&self, job_id: &str, max_checks: u32) -> Result<JobStatus, ClientError> {
        for attempt in 1..=max_checks {
            let status = self.get_job_status(job_id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tracing::trace!(job_id = %job_id, attempt, state = %status.state, "Job still running");
            tokio::time::sleep(self.job_poll_interval).await;
        }

        Err(ClientError::StillRunning {
            job_id: job_id.to_string(),
            attempts: max_checks,
        })
    }

    /// Redeem an invite code for a user.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InviteAlreadyUsed` if the code was redeemed
    /// before, `ClientError::NotFound` if it does not exist.
    pub async fn redeem_invite(
        &self,
        code: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Redemption, ClientError> {
        let request = RedeemInviteRequest {
            code: code.into(),
            user_id: user_id.into(),
        };
        let response = self.post("/v1/invites/redeem").json(&request).send().await?;
        self.handle_response(response).await
    }

    /// Check whether a user can afford an operation or job service.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Api` with status 400 for an unpriced code.
    pub async fn check_credits(
        &self,
        user_id: &str,
        operation: &str,
    ) -> Result<CreditCheck, ClientError> {
        let response = self
            .get("/v1/credits/check")
            .query(&[("userId", user_id), ("operation", operation)])
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Charge an operation that completes within the caller's request.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InsufficientFunds` when the user cannot pay.
    pub async fn deduct_credits(
        &self,
        user_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Result<Deduction, ClientError> {
        let request = DeductRequest {
            user_id: user_id.into(),
            operation: operation.into(),
        };
        let response = self.post("/v1/credits/deduct").json(&request).send().await?;
        self.handle_response(response).await
    }

    /// Spending totals for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn credit_stats(&self, user_id: &str) -> Result<CreditStats, ClientError> {
        let response = self
            .get("/v1/credits/stats")
            .query(&[("userId", user_id)])
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Get the caller's balance (requires user JWT, not service API key).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_my_balance(&self, user_jwt: &str) -> Result<Balance, ClientError> {
        let response = self
            .client
            .get(format!("{}/v1/me/balance", self.base_url))
            .header("authorization", format!("Bearer {user_jwt}"))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        // Try to parse error response
        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        let Ok(api_error) = error_body else {
            return Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            });
        };

        let detail = |key: &str| {
            api_error
                .error
                .details
                .as_ref()
                .and_then(|d| d.get(key))
                .cloned()
        };
        let number = |key: &str| detail(key).as_ref().and_then(serde_json::Value::as_i64).unwrap_or(0);
        let job_id = || {
            detail("jobId")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        };

        let message = api_error.error.message.clone();
        match api_error.error.code.as_str() {
            "insufficient_funds" => Err(ClientError::InsufficientFunds {
                balance: number("balance"),
                required: number("required"),
            }),
            "provider_rejected" => Err(ClientError::ProviderRejected {
                job_id: job_id(),
                message,
            }),
            "provider_unavailable" => Err(ClientError::ProviderUnavailable {
                job_id: job_id(),
                message,
            }),
            "invite_already_used" => Err(ClientError::InviteAlreadyUsed { message }),
            "not_found" => Err(ClientError::NotFound { message }),
            code => Err(ClientError::Api {
                code: code.to_string(),
                message,
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
    /// Service name to include in requests.
    pub service_name: String,
    /// Delay between status reads in [`LedgerClient::wait_for_job`]
    /// (default: 2s).
    pub job_poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            service_name: "unknown".to_string(),
            job_poll_interval: Duration::from_secs(2),
        }
    }
}

impl ClientOptions {
    /// Create options with a service name.
    #[must_use]
    pub fn with_service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: name.into(),
            ..Self::default()
        }
    }
}
