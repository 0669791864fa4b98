//! Job submission and tracking integration tests.

mod common;

use common::{music_params, TestHarness};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use dua_ledger_store::Store;

fn kinds(transactions: &[Value]) -> Vec<&str> {
    transactions
        .iter()
        .map(|tx| tx["kind"].as_str().unwrap())
        .collect()
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn music_job_runs_to_success() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;

    harness.suno_accepts("suno-task-1").await;
    harness.suno_status("suno-task-1", "PENDING", Some(1)).await;
    harness.suno_status("suno-task-1", "TEXT_SUCCESS", Some(1)).await;
    harness.suno_status("suno-task-1", "SUCCESS", None).await;

    let response = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["providerJobId"], "suno-task-1");
    assert_eq!(body["costReserved"], 6);
    assert_eq!(harness.balance(&user_id).await, 94);

    let job_id = body["jobId"].as_str().unwrap();
    let job = harness.wait_settled(job_id).await;
    assert_eq!(job["state"], "SUCCEEDED");
    assert_eq!(
        job["resultPayload"]["sunoData"][0]["audioUrl"],
        "https://cdn.example/track.mp3"
    );

    // Success keeps the reservation
    assert_eq!(harness.balance(&user_id).await, 94);
    let transactions = harness.transactions(&user_id).await;
    assert_eq!(kinds(&transactions), vec!["deduction", "credit"]);
    assert_eq!(transactions[0]["amountDelta"], -6);
    assert_eq!(transactions[0]["linkedJobId"], job_id);
    assert_eq!(transactions[0]["balanceAfter"], 94);
}

#[tokio::test]
async fn status_endpoint_reports_state() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(20).await;

    harness.suno_accepts("suno-task-2").await;
    harness.suno_status("suno-task-2", "PENDING", None).await;

    let body: Value = harness
        .submit(&user_id, "music_generate_v4", music_params())
        .await
        .json();
    let job_id = body["jobId"].as_str().unwrap();

    let response = harness
        .server
        .get(&format!("/v1/jobs/{job_id}/status"))
        .add_header("x-api-key", &harness.service_api_key)
        .await;
    response.assert_status_ok();
    let status: Value = response.json();
    assert_eq!(status["jobId"], job_id);
    assert_eq!(status["state"], "SUBMITTED");
}

#[tokio::test]
async fn insufficient_funds_creates_nothing() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(3).await;
    harness.suno_accepts("never-used").await;

    let response = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await;

    response.assert_status(axum::http::StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "insufficient_funds");
    assert_eq!(body["error"]["details"]["balance"], 3);
    assert_eq!(body["error"]["details"]["required"], 6);

    assert_eq!(harness.suno_calls("/generate").await, 0);
    assert_eq!(harness.balance(&user_id).await, 3);
    assert_eq!(harness.transactions(&user_id).await.len(), 1);
    assert!(harness.store.list_active_jobs().await.unwrap().is_empty());
    assert!(harness.store.list_unsettled_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn submit_without_api_key_fails() {
    let harness = TestHarness::new().await;

    let response = harness
        .server
        .post("/v1/jobs")
        .json(&json!({
            "userId": dua_ledger_core::UserId::generate().to_string(),
            "serviceType": "music_generate_v5",
            "params": music_params(),
        }))
        .await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn unknown_service_is_bad_request() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;

    let response = harness.submit(&user_id, "music_generate_v9", music_params()).await;

    response.assert_status_bad_request();
    assert_eq!(harness.balance(&user_id).await, 100);
}

#[tokio::test]
async fn invalid_params_are_rejected_before_reserving() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;

    // Music without a prompt
    harness
        .submit(&user_id, "music_generate_v5", json!({ "instrumental": true }))
        .await
        .assert_status_bad_request();

    // Image to video without an image
    harness
        .submit(&user_id, "video_gen4_5s", json!({ "promptText": "a cat" }))
        .await
        .assert_status_bad_request();

    assert_eq!(harness.balance(&user_id).await, 100);
    assert_eq!(harness.suno_calls("/generate").await, 0);
}

// ============================================================================
// Failure and refunds
// ============================================================================

#[tokio::test]
async fn failed_generation_is_refunded_once() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(50).await;

    harness.suno_accepts("suno-task-3").await;
    harness
        .suno_status("suno-task-3", "GENERATE_AUDIO_FAILED", None)
        .await;

    let body: Value = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await
        .json();
    let job_id = body["jobId"].as_str().unwrap();

    let job = harness.wait_settled(job_id).await;
    assert_eq!(job["state"], "FAILED");
    assert_eq!(job["failureReason"], "audio generation failed");

    assert_eq!(harness.balance(&user_id).await, 50);
    let transactions = harness.transactions(&user_id).await;
    assert_eq!(kinds(&transactions), vec!["refund", "deduction", "credit"]);
    assert_eq!(transactions[0]["amountDelta"], 6);
    assert_eq!(transactions[0]["linkedJobId"], job_id);

    // A sweep over the settled job changes nothing
    let response = harness
        .server
        .post("/v1/admin/sweep")
        .add_header("x-admin-key", &harness.admin_api_key)
        .await;
    response.assert_status_ok();
    assert_eq!(harness.transactions(&user_id).await.len(), 3);
    assert_eq!(harness.balance(&user_id).await, 50);
}

#[tokio::test]
async fn provider_rejection_refunds_and_returns_422() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(50).await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 400,
            "msg": "prompt contains sensitive words",
            "data": null
        })))
        .expect(1)
        .mount(&harness.suno)
        .await;

    let response = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await;

    response.assert_status(axum::http::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "provider_rejected");
    assert_eq!(body["error"]["details"]["refunded"], true);

    let job_id = body["error"]["details"]["jobId"].as_str().unwrap();
    let job = harness.job(job_id).await;
    assert_eq!(job["state"], "FAILED");
    assert!(!job["settledAt"].is_null());
    assert_eq!(harness.balance(&user_id).await, 50);
}

#[tokio::test]
async fn unreachable_provider_times_out_and_refunds() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(50).await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&harness.suno)
        .await;

    let response = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await;

    response.assert_status(axum::http::StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "provider_unavailable");

    let job_id = body["error"]["details"]["jobId"].as_str().unwrap();
    let job = harness.job(job_id).await;
    assert_eq!(job["state"], "TIMED_OUT");
    assert!(job["providerJobId"].is_null());
    assert_eq!(harness.balance(&user_id).await, 50);
}

#[tokio::test]
async fn transient_dispatch_failure_is_retried() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(50).await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&harness.suno)
        .await;
    harness.suno_accepts("suno-task-4").await;
    harness.suno_status("suno-task-4", "SUCCESS", None).await;

    let response = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();

    let job = harness.wait_settled(body["jobId"].as_str().unwrap()).await;
    assert_eq!(job["state"], "SUCCEEDED");
    assert_eq!(harness.suno_calls("/generate").await, 2);
    assert_eq!(harness.balance(&user_id).await, 44);
}

// ============================================================================
// Video
// ============================================================================

#[tokio::test]
async fn image_to_video_job_runs_to_success() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;

    Mock::given(method("POST"))
        .and(path("/image_to_video"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "rw-1" })))
        .expect(1)
        .mount(&harness.runway)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/rw-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "RUNNING",
            "progress": 0.4
        })))
        .up_to_n_times(1)
        .mount(&harness.runway)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/rw-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "SUCCEEDED",
            "output": ["https://cdn.example/clip.mp4"]
        })))
        .mount(&harness.runway)
        .await;

    let response = harness
        .submit(
            &user_id,
            "video_gen4_5s",
            json!({
                "promptImage": "https://cdn.example/still.png",
                "promptText": "slow dolly in",
            }),
        )
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["provider"], "runway");
    assert_eq!(harness.balance(&user_id).await, 80);

    let job = harness.wait_settled(body["jobId"].as_str().unwrap()).await;
    assert_eq!(job["state"], "SUCCEEDED");
    assert_eq!(job["resultPayload"]["output"][0], "https://cdn.example/clip.mp4");
    assert_eq!(harness.balance(&user_id).await, 80);
}

#[tokio::test]
async fn unconfigured_provider_is_unavailable() {
    let harness = TestHarness::with_config(|config| config.runway.api_key = None).await;
    let user_id = harness.funded_user(100).await;

    let response = harness
        .submit(
            &user_id,
            "video_gen4_5s",
            json!({ "promptImage": "https://cdn.example/still.png" }),
        )
        .await;

    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(harness.balance(&user_id).await, 100);
}

// ============================================================================
// Lookup
// ============================================================================

#[tokio::test]
async fn job_lookup_errors() {
    let harness = TestHarness::new().await;

    harness
        .server
        .get("/v1/jobs/not-a-ulid")
        .add_header("x-api-key", &harness.service_api_key)
        .await
        .assert_status_bad_request();

    harness
        .server
        .get(&format!("/v1/jobs/{}", ulid::Ulid::new()))
        .add_header("x-api-key", &harness.service_api_key)
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn catalog_lists_services() {
    let harness = TestHarness::with_config(|config| config.runway.api_key = None).await;

    let response = harness
        .server
        .get("/v1/services")
        .add_header("x-api-key", &harness.service_api_key)
        .await;
    response.assert_status_ok();

    let services: Vec<Value> = response.json();
    let find = |code: &str| {
        services
            .iter()
            .find(|s| s["serviceType"] == code)
            .cloned()
            .unwrap()
    };
    assert_eq!(find("music_generate_v5")["cost"], 6);
    assert_eq!(find("music_generate_v5")["available"], true);
    assert_eq!(find("video_gen4_10s")["cost"], 40);
    assert_eq!(find("video_gen4_10s")["available"], false);
}
