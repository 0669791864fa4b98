//! Suno music generation through the kie.ai API.
//!
//! Every response is wrapped in a `{code, msg, data}` envelope where
//! `code == 200` means success regardless of the HTTP status. Tasks move
//! through `PENDING -> TEXT_SUCCESS -> FIRST_SUCCESS -> SUCCESS`; callbacks
//! arrive as `text`, `first`, `complete` or `error`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dua_ledger_core::{
    JobState, LedgerError, Observation, ProviderJobId, ProviderKind, ServiceSpec, ServiceType,
};

use super::{check_len, http_client, ProviderAdapter, ProviderError, SubmitRequest};

/// Default kie.ai API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.kie.ai/api/v1";

/// Provider-recommended polling cadence.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Envelope codes worth retrying: timeout, rate limit, maintenance, server error.
const TRANSIENT_CODES: [i64; 5] = [408, 429, 455, 500, 503];

const SUCCESS_CODE: i64 = 200;

const MAX_SIMPLE_PROMPT: usize = 500;
const MAX_TITLE: usize = 80;

/// Suno API adapter.
#[derive(Clone)]
pub struct SunoAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SunoAdapter {
    /// Create a new adapter.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API base, e.g. [`DEFAULT_BASE_URL`]
    /// * `api_key` - kie.ai bearer token
    /// * `call_timeout` - per-request timeout
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Client` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: &str,
        call_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(call_timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn post_task<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ProviderJobId, ProviderError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let created: TaskCreated = read_envelope(response).await?;
        ProviderJobId::new(created.task_id)
            .map_err(|e| ProviderError::Transient(format!("response carried no task id: {e}")))
    }
}

impl std::fmt::Debug for SunoAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SunoAdapter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for SunoAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Suno
    }

    fn default_poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    fn supports_callbacks(&self) -> bool {
        true
    }

    fn validate(&self, spec: &ServiceSpec, params: &Value) -> Result<(), LedgerError> {
        match spec.service_type {
            ServiceType::MusicGenerate => parse_params::<MusicParams>(params)?.validate(&spec.model),
            ServiceType::MusicExtend => parse_params::<ExtendParams>(params)?.validate(),
            other => Err(LedgerError::InvalidParams(format!(
                "{other:?} is not a music service"
            ))),
        }
    }

    async fn submit(&self, request: &SubmitRequest<'_>) -> Result<ProviderJobId, ProviderError> {
        let model = request.spec.model.as_str();
        let call_back_url = request.callback_url.as_deref();

        tracing::debug!(
            job_id = %request.job_id,
            service = %request.spec.code,
            model = %model,
            callbacks = %call_back_url.is_some(),
            "Submitting Suno task"
        );

        match request.spec.service_type {
            ServiceType::MusicGenerate => {
                let params: MusicParams = parse_params(request.params).map_err(rejected)?;
                let body = TaskBody {
                    params: &params,
                    model,
                    call_back_url,
                };
                self.post_task("/generate", &body).await
            }
            ServiceType::MusicExtend => {
                let params: ExtendParams = parse_params(request.params).map_err(rejected)?;
                let body = TaskBody {
                    params: &params,
                    model,
                    call_back_url,
                };
                self.post_task("/generate/extend", &body).await
            }
            _ => Err(ProviderError::Unsupported {
                provider: ProviderKind::Suno,
                operation: "video generation",
            }),
        }
    }

    async fn status(&self, provider_job_id: &ProviderJobId) -> Result<Observation, ProviderError> {
        let response = self
            .client
            .get(format!("{}/generate/record-info", self.base_url))
            .query(&[("taskId", provider_job_id.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let record: TaskRecord = read_envelope(response).await?;
        Ok(record.into_observation())
    }

    fn parse_callback(&self, body: &Value) -> Result<(ProviderJobId, Observation), ProviderError> {
        let callback = CallbackBody::deserialize(body).map_err(|e| ProviderError::Rejected {
            code: 400,
            message: format!("malformed Suno callback: {e}"),
        })?;

        let provider_job_id =
            ProviderJobId::new(callback.data.task_id).map_err(|e| ProviderError::Rejected {
                code: 400,
                message: format!("callback without task id: {e}"),
            })?;

        if callback.code != SUCCESS_CODE {
            let reason = if callback.msg.is_empty() {
                format!("provider error {}", callback.code)
            } else {
                callback.msg
            };
            return Ok((provider_job_id, Observation::failed(reason)));
        }

        let payload = callback.data.data.unwrap_or(Value::Null);
        let observation = match callback.data.callback_type.as_str() {
            "text" => Observation::state(JobState::TextReady).with_payload(payload),
            "first" => Observation::state(JobState::PartialReady).with_payload(payload),
            "complete" => Observation::succeeded(payload),
            "error" => Observation::failed(if callback.msg.is_empty() {
                "generation failed".to_string()
            } else {
                callback.msg
            }),
            other => {
                return Err(ProviderError::Rejected {
                    code: 400,
                    message: format!("unknown callbackType: {other}"),
                })
            }
        };

        Ok((provider_job_id, observation))
    }
}

/// Map a task status onto the internal state machine.
#[must_use]
pub fn map_status(status: &str) -> Option<JobState> {
    match status {
        "PENDING" => Some(JobState::Submitted),
        "TEXT_SUCCESS" => Some(JobState::TextReady),
        "FIRST_SUCCESS" => Some(JobState::PartialReady),
        "SUCCESS" => Some(JobState::Succeeded),
        "CREATE_TASK_FAILED"
        | "GENERATE_AUDIO_FAILED"
        | "CALLBACK_EXCEPTION"
        | "SENSITIVE_WORD_ERROR" => Some(JobState::Failed),
        _ => None,
    }
}

/// Classify an envelope or HTTP error code.
fn classify(code: i64, message: String) -> ProviderError {
    if TRANSIENT_CODES.contains(&code) {
        ProviderError::Transient(format!("{code}: {message}"))
    } else {
        ProviderError::Rejected { code, message }
    }
}

fn rejected(err: LedgerError) -> ProviderError {
    ProviderError::Rejected {
        code: 422,
        message: err.to_string(),
    }
}

async fn read_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();

    let envelope: Envelope<T> = match response.json().await {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => {
            return Err(ProviderError::Transient(format!("malformed response: {e}")))
        }
        Err(_) => return Err(classify(i64::from(status.as_u16()), format!("HTTP {status}"))),
    };

    if envelope.code != SUCCESS_CODE {
        return Err(classify(envelope.code, envelope.msg));
    }

    envelope
        .data
        .ok_or_else(|| ProviderError::Transient("response without data".into()))
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, LedgerError> {
    T::deserialize(params).map_err(|e| LedgerError::InvalidParams(e.to_string()))
}

fn check_weight(name: &str, value: Option<f64>) -> Result<(), LedgerError> {
    match value {
        Some(w) if !(0.0..=1.0).contains(&w) => Err(LedgerError::InvalidParams(format!(
            "{name} must be between 0 and 1"
        ))),
        _ => Ok(()),
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskCreated {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecord {
    status: String,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error_message: Option<String>,
}

impl TaskRecord {
    fn into_observation(self) -> Observation {
        let Some(state) = map_status(&self.status) else {
            tracing::warn!(status = %self.status, "Unrecognized Suno status, treating as pending");
            return Observation::state(JobState::Submitted);
        };

        if state == JobState::Failed {
            return Observation::failed(self.error_message.unwrap_or(self.status));
        }

        let observation = Observation::state(state);
        match self.response {
            Some(payload) if !payload.is_null() => observation.with_payload(payload),
            _ => observation,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    code: i64,
    #[serde(default)]
    msg: String,
    data: CallbackData,
}

#[derive(Debug, Deserialize)]
struct CallbackData {
    #[serde(rename = "callbackType")]
    callback_type: String,
    #[serde(alias = "taskId")]
    task_id: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskBody<'a, P: Serialize> {
    #[serde(flatten)]
    params: &'a P,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_back_url: Option<&'a str>,
}

/// Parameters for `/generate`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct MusicParams {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    custom_mode: bool,
    #[serde(default)]
    instrumental: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    negative_tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vocal_gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    style_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weirdness_constraint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    audio_weight: Option<f64>,
}

impl MusicParams {
    fn validate(&self, model: &str) -> Result<(), LedgerError> {
        if self.prompt.trim().is_empty() {
            return Err(LedgerError::InvalidParams("prompt is required".into()));
        }

        let legacy_model = matches!(model, "V3_5" | "V4");
        if self.custom_mode {
            let style = non_blank(self.style.as_deref())
                .ok_or_else(|| LedgerError::InvalidParams("style is required in custom mode".into()))?;
            let title = non_blank(self.title.as_deref())
                .ok_or_else(|| LedgerError::InvalidParams("title is required in custom mode".into()))?;
            check_len("prompt", &self.prompt, if legacy_model { 3000 } else { 5000 })?;
            check_len("style", style, if legacy_model { 200 } else { 1000 })?;
            check_len("title", title, MAX_TITLE)?;
        } else {
            check_len("prompt", &self.prompt, MAX_SIMPLE_PROMPT)?;
        }

        if let Some(gender) = self.vocal_gender.as_deref() {
            if !matches!(gender, "m" | "f") {
                return Err(LedgerError::InvalidParams("vocalGender must be m or f".into()));
            }
        }

        check_weight("styleWeight", self.style_weight)?;
        check_weight("weirdnessConstraint", self.weirdness_constraint)?;
        check_weight("audioWeight", self.audio_weight)
    }
}

/// Parameters for `/generate/extend`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtendParams {
    #[serde(default)]
    audio_id: String,
    #[serde(default)]
    default_param_flag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    continue_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    negative_tags: Option<String>,
}

impl ExtendParams {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.audio_id.trim().is_empty() {
            return Err(LedgerError::InvalidParams("audioId is required".into()));
        }
        if !self.default_param_flag {
            return Ok(());
        }
        for (name, value) in [
            ("prompt", &self.prompt),
            ("style", &self.style),
            ("title", &self.title),
        ] {
            if non_blank(value.as_deref()).is_none() {
                return Err(LedgerError::InvalidParams(format!(
                    "{name} is required when defaultParamFlag is true"
                )));
            }
        }
        if let Some(title) = &self.title {
            check_len("title", title, MAX_TITLE)?;
        }
        match self.continue_at {
            Some(at) if at >= 0.0 => Ok(()),
            _ => Err(LedgerError::InvalidParams(
                "continueAt must be >= 0 when defaultParamFlag is true".into(),
            )),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
