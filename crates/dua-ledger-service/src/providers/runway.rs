//! Runway video generation.
//!
//! Runway has no callbacks; tasks are tracked by polling `GET /tasks/{id}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use dua_ledger_core::{
    JobState, LedgerError, Observation, ProviderJobId, ProviderKind, ServiceSpec, ServiceType,
};

use super::{
    check_len, http_client, required_str, str_param, ProviderAdapter, ProviderError, SubmitRequest,
};

/// Default Runway API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.dev.runwayml.com/v1";

/// Value sent in the `X-Runway-Version` header.
pub const API_VERSION: &str = "2024-11-06";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_DURATION_SECS: u32 = 5;

const MAX_PROMPT_TEXT: usize = 1000;

/// Output ratios accepted across the supported models.
const SUPPORTED_RATIOS: [&str; 10] = [
    "1280:720", "720:1280", "1104:832", "832:1104", "960:960", "1584:672", "1280:768",
    "768:1280", "848:480", "640:480",
];

/// Runway API adapter.
#[derive(Clone)]
pub struct RunwayAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RunwayAdapter {
    /// Create a new adapter.
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

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Runway-Version", API_VERSION)
    }
}

impl std::fmt::Debug for RunwayAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunwayAdapter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for RunwayAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Runway
    }

    fn default_poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    fn supports_callbacks(&self) -> bool {
        false
    }

    fn validate(&self, spec: &ServiceSpec, params: &Value) -> Result<(), LedgerError> {
        match spec.service_type {
            ServiceType::ImageToVideo => {
                let image = required_str(params, "promptImage")?;
                if !(image.starts_with("https://")
                    || image.starts_with("http://")
                    || image.starts_with("data:image/"))
                {
                    return Err(LedgerError::InvalidParams(
                        "promptImage must be an http(s) URL or an image data URI".into(),
                    ));
                }
            }
            ServiceType::VideoToVideo => {
                required_str(params, "videoUri")?;
                required_str(params, "promptText")?;
            }
            other => {
                return Err(LedgerError::InvalidParams(format!(
                    "{other:?} is not a video service"
                )))
            }
        }

        if let Some(text) = str_param(params, "promptText") {
            check_len("promptText", text, MAX_PROMPT_TEXT)?;
        }
        if let Some(ratio) = str_param(params, "ratio") {
            if !SUPPORTED_RATIOS.contains(&ratio) {
                return Err(LedgerError::InvalidParams(format!(
                    "unsupported ratio {ratio}"
                )));
            }
        }
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest<'_>) -> Result<ProviderJobId, ProviderError> {
        let spec = request.spec;
        let params = request.params;
        let ratio = str_param(params, "ratio").unwrap_or_else(|| default_ratio(&spec.model));

        let (path, body) = match spec.service_type {
            ServiceType::ImageToVideo => (
                "/image_to_video",
                json!({
                    "model": spec.model,
                    "promptImage": str_param(params, "promptImage"),
                    "promptText": str_param(params, "promptText"),
                    "ratio": ratio,
                    "duration": spec.duration_secs.unwrap_or(DEFAULT_DURATION_SECS),
                    "seed": params.get("seed").and_then(Value::as_u64),
                }),
            ),
            ServiceType::VideoToVideo => (
                "/video_to_video",
                json!({
                    "model": spec.model,
                    "videoUri": str_param(params, "videoUri"),
                    "promptText": str_param(params, "promptText"),
                    "ratio": ratio,
                    "seed": params.get("seed").and_then(Value::as_u64),
                }),
            ),
            _ => {
                return Err(ProviderError::Unsupported {
                    provider: ProviderKind::Runway,
                    operation: "music generation",
                })
            }
        };
        let body = strip_nulls(body);

        tracing::debug!(
            job_id = %request.job_id,
            service = %spec.code,
            model = %spec.model,
            "Submitting Runway task"
        );

        let response = self
            .request(reqwest::Method::POST, path)
            .json(&body)
            .send()
            .await?;
        let created: TaskCreated = read_json(response).await?;

        ProviderJobId::new(created.id)
            .map_err(|e| ProviderError::Transient(format!("response carried no task id: {e}")))
    }

    async fn status(&self, provider_job_id: &ProviderJobId) -> Result<Observation, ProviderError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/tasks/{}", provider_job_id.as_str()),
            )
            .send()
            .await?;
        let task: Task = read_json(response).await?;
        Ok(task.into_observation())
    }

    fn parse_callback(&self, _body: &Value) -> Result<(ProviderJobId, Observation), ProviderError> {
        Err(ProviderError::Unsupported {
            provider: ProviderKind::Runway,
            operation: "callbacks",
        })
    }
}

/// Map a task status onto the internal state machine.
#[must_use]
pub fn map_status(status: &str) -> Option<JobState> {
    match status {
        "PENDING" | "THROTTLED" => Some(JobState::Submitted),
        "RUNNING" => Some(JobState::PartialReady),
        "SUCCEEDED" => Some(JobState::Succeeded),
        "FAILED" | "CANCELLED" => Some(JobState::Failed),
        _ => None,
    }
}

fn default_ratio(model: &str) -> &'static str {
    if model.starts_with("gen3") {
        "1280:768"
    } else {
        "1280:720"
    }
}

fn strip_nulls(mut body: Value) -> Value {
    if let Value::Object(map) = &mut body {
        map.retain(|_, v| !v.is_null());
    }
    body
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed response: {e}")));
    }

    let message = response
        .json::<ErrorBody>()
        .await
        .map_or_else(|_| format!("HTTP {status}"), |body| body.error);

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(ProviderError::Transient(format!("{status}: {message}")))
    } else {
        Err(ProviderError::Rejected {
            code: i64::from(status.as_u16()),
            message,
        })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TaskCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    status: String,
    #[serde(default)]
    output: Option<Vec<String>>,
    #[serde(default)]
    failure: Option<String>,
    #[serde(default)]
    failure_code: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
}

impl Task {
    fn into_observation(self) -> Observation {
        match map_status(&self.status) {
            Some(JobState::Succeeded) => Observation::succeeded(json!({
                "output": self.output.unwrap_or_default(),
            })),
            Some(JobState::Failed) => {
                let reason = match (self.failure, self.failure_code) {
                    (Some(failure), Some(code)) => format!("{failure} ({code})"),
                    (Some(failure), None) => failure,
                    (None, Some(code)) => code,
                    (None, None) => self.status,
                };
                Observation::failed(reason)
            }
            Some(JobState::PartialReady) => Observation::state(JobState::PartialReady)
                .with_payload(json!({ "progress": self.progress })),
            Some(state) => Observation::state(state),
            None => {
                tracing::warn!(status = %self.status, "Unrecognized Runway status, treating as pending");
                Observation::state(JobState::Submitted)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dua_ledger_core::PricingCatalog;

    fn adapter() -> RunwayAdapter {
        RunwayAdapter::new(DEFAULT_BASE_URL, "key", Duration::from_secs(5)).unwrap()
    }

    fn spec(code: &str) -> ServiceSpec {
        PricingCatalog::default().resolve(code).unwrap().clone()
    }

    #[test]
    fn status_vocabulary_is_normalized() {
        assert_eq!(map_status("THROTTLED"), Some(JobState::Submitted));
        assert_eq!(map_status("RUNNING"), Some(JobState::PartialReady));
        assert_eq!(map_status("SUCCEEDED"), Some(JobState::Succeeded));
        assert_eq!(map_status("CANCELLED"), Some(JobState::Failed));
        assert_eq!(map_status("SUCCESS"), None);
    }

    #[test]
    fn failed_task_reason_includes_code() {
        let task = Task {
            status: "FAILED".into(),
            output: None,
            failure: Some("Content moderation".into()),
            failure_code: Some("SAFETY.INPUT".into()),
            progress: None,
        };
        let observation = task.into_observation();
        assert_eq!(observation.state, JobState::Failed);
        assert_eq!(
            observation.failure_reason.as_deref(),
            Some("Content moderation (SAFETY.INPUT)")
        );
    }

    #[test]
    fn succeeded_task_carries_output() {
        let task = Task {
            status: "SUCCEEDED".into(),
            output: Some(vec!["https://cdn.example/v.mp4".into()]),
            failure: None,
            failure_code: None,
            progress: Some(1.0),
        };
        let observation = task.into_observation();
        assert_eq!(
            observation.result_payload,
            Some(json!({"output": ["https://cdn.example/v.mp4"]}))
        );
    }

    #[test]
    fn image_to_video_needs_an_image() {
        let spec = spec("video_gen4_5s");
        assert!(adapter()
            .validate(&spec, &json!({"promptImage": "https://img.example/a.png"}))
            .is_ok());
        assert!(adapter().validate(&spec, &json!({"promptText": "waves"})).is_err());
        assert!(adapter()
            .validate(&spec, &json!({"promptImage": "ftp://img"}))
            .is_err());
    }

    #[test]
    fn video_to_video_needs_video_and_text() {
        let spec = spec("video_to_video");
        assert!(adapter()
            .validate(&spec, &json!({"videoUri": "https://v.example/a.mp4"}))
            .is_err());
        assert!(adapter()
            .validate(
                &spec,
                &json!({"videoUri": "https://v.example/a.mp4", "promptText": "anime style"})
            )
            .is_ok());
    }

    #[test]
    fn ratio_and_prompt_limits() {
        let spec = spec("video_gen4_10s");
        let bad_ratio = json!({"promptImage": "https://i/a.png", "ratio": "1:1"});
        assert!(adapter().validate(&spec, &bad_ratio).is_err());

        let long = json!({"promptImage": "https://i/a.png", "promptText": "x".repeat(1001)});
        assert!(adapter().validate(&spec, &long).is_err());
    }

    #[test]
    fn callbacks_are_unsupported() {
        assert!(!adapter().supports_callbacks());
        assert!(matches!(
            adapter().parse_callback(&json!({})),
            Err(ProviderError::Unsupported { .. })
        ));
    }

    #[test]
    fn gen3_uses_its_own_default_ratio() {
        assert_eq!(default_ratio("gen3a_turbo"), "1280:768");
        assert_eq!(default_ratio("gen4_turbo"), "1280:720");
    }
}
