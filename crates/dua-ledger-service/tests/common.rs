//! Common test utilities for dua-ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_test::TestServer;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dua_ledger_core::UserId;
use dua_ledger_service::config::ProviderSettings;
use dua_ledger_service::{create_router, AppState, JobTracker, ServiceConfig, TrackingConfig};
use dua_ledger_store::MemoryStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The backing store, for assertions the API doesn't expose.
    pub store: Arc<MemoryStore>,
    /// The job tracker behind the router.
    pub tracker: JobTracker,
    /// Mock Suno (kie.ai) API.
    pub suno: MockServer,
    /// Mock Runway API.
    pub runway: MockServer,
    /// The service API key for service-to-service requests.
    pub service_api_key: String,
    /// The admin API key.
    pub admin_api_key: String,
}

impl TestHarness {
    /// Harness with polling every 20ms and no callback secret.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Harness whose config is adjusted by `customize` before the router
    /// is built.
    pub async fn with_config(customize: impl FnOnce(&mut ServiceConfig)) -> Self {
        let suno = MockServer::start().await;
        let runway = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());

        let service_api_key = "test-service-key".to_string();
        let admin_api_key = "test-admin-key".to_string();

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(service_api_key.clone()),
            admin_api_key: Some(admin_api_key.clone()),
            suno: ProviderSettings {
                api_url: suno.uri(),
                api_key: Some("suno-test-key".into()),
            },
            runway: ProviderSettings {
                api_url: runway.uri(),
                api_key: Some("runway-test-key".into()),
            },
            tracking: TrackingConfig {
                poll_interval: Some(Duration::from_millis(20)),
                job_timeout: Duration::from_secs(10),
                max_poll_attempts: 200,
                poll_call_timeout: Duration::from_secs(2),
                transient_retry_cap: 2,
                sweep_interval: Duration::from_secs(300),
            },
            ..ServiceConfig::default()
        };
        customize(&mut config);

        let state = AppState::new(store.clone(), config);
        let tracker = state.tracker.clone();
        let router: Router = create_router(state);
        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            store,
            tracker,
            suno,
            runway,
            service_api_key,
            admin_api_key,
        }
    }

    /// Create a user holding `units` through the API.
    pub async fn funded_user(&self, units: i64) -> UserId {
        let user_id = UserId::generate();
        self.server
            .post("/v1/accounts")
            .add_header("x-api-key", &self.service_api_key)
            .json(&json!({ "userId": user_id.to_string(), "initialUnits": units }))
            .await
            .assert_status(axum::http::StatusCode::CREATED);
        user_id
    }

    /// Primary balance as reported by the API.
    pub async fn balance(&self, user_id: &UserId) -> i64 {
        let response = self
            .server
            .get("/v1/balance")
            .add_query_param("userId", user_id.to_string())
            .add_header("x-api-key", &self.service_api_key)
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["units"], body["mirrorUnits"], "mirror diverged");
        body["units"].as_i64().unwrap()
    }

    /// Transactions of `user_id`, newest first.
    pub async fn transactions(&self, user_id: &UserId) -> Vec<Value> {
        let response = self
            .server
            .get("/v1/transactions")
            .add_query_param("userId", user_id.to_string())
            .add_header("x-api-key", &self.service_api_key)
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        body["transactions"].as_array().unwrap().clone()
    }

    /// Submit a job through the API and return the raw response.
    pub async fn submit(&self, user_id: &UserId, service: &str, params: Value) -> axum_test::TestResponse {
        self.server
            .post("/v1/jobs")
            .add_header("x-api-key", &self.service_api_key)
            .json(&json!({
                "userId": user_id.to_string(),
                "serviceType": service,
                "params": params,
            }))
            .await
    }

    /// Full job record.
    pub async fn job(&self, job_id: &str) -> Value {
        let response = self
            .server
            .get(&format!("/v1/jobs/{job_id}"))
            .add_header("x-api-key", &self.service_api_key)
            .await;
        response.assert_status_ok();
        response.json()
    }

    /// Wait until the job is terminal and settled.
    pub async fn wait_settled(&self, job_id: &str) -> Value {
        for _ in 0..250 {
            let job = self.job(job_id).await;
            if !job["settledAt"].is_null() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not settle");
    }

    /// Make Suno accept the next generation with `task_id`.
    pub async fn suno_accepts(&self, task_id: &str) {
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "msg": "success",
                "data": { "taskId": task_id }
            })))
            .mount(&self.suno)
            .await;
    }

    /// Make Suno report `status` for `task_id`, at most `times` times when
    /// given.
    pub async fn suno_status(&self, task_id: &str, status: &str, times: Option<u64>) {
        let body = match status {
            "SUCCESS" => json!({
                "code": 200,
                "msg": "success",
                "data": {
                    "taskId": task_id,
                    "status": status,
                    "response": { "sunoData": [{ "audioUrl": "https://cdn.example/track.mp3" }] }
                }
            }),
            "GENERATE_AUDIO_FAILED" => json!({
                "code": 200,
                "msg": "success",
                "data": { "taskId": task_id, "status": status, "errorMessage": "audio generation failed" }
            }),
            _ => json!({
                "code": 200,
                "msg": "success",
                "data": { "taskId": task_id, "status": status }
            }),
        };

        let mock = Mock::given(method("GET"))
            .and(path("/generate/record-info"))
            .and(query_param("taskId", task_id))
            .respond_with(ResponseTemplate::new(200).set_body_json(body));
        match times {
            Some(n) => mock.up_to_n_times(n).mount(&self.suno).await,
            None => mock.mount(&self.suno).await,
        }
    }

    /// Number of requests the mock Suno API received on `route`.
    pub async fn suno_calls(&self, route: &str) -> usize {
        self.suno
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == route)
            .count()
    }
}

/// Generation parameters Suno accepts.
pub fn music_params() -> Value {
    json!({ "prompt": "lofi beats to study to", "instrumental": true })
}

/// A Suno callback body.
pub fn suno_callback(task_id: &str, callback_type: &str) -> Value {
    json!({
        "code": 200,
        "msg": "All generated successfully.",
        "data": {
            "callbackType": callback_type,
            "task_id": task_id,
            "data": [{ "id": "track-1", "audio_url": "https://cdn.example/track.mp3" }]
        }
    })
}
