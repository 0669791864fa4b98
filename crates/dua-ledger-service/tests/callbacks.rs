//! Provider callback integration tests.

mod common;

use axum::body::Bytes;
use common::{music_params, suno_callback, TestHarness};
use serde_json::Value;

use dua_ledger_service::crypto::hmac_sha256_hex;
use dua_ledger_service::handlers::callbacks::SIGNATURE_HEADER;

const SECRET: &str = "whsec-test";

async fn signed_harness() -> TestHarness {
    TestHarness::with_config(|config| {
        config.callback_secret = Some(SECRET.into());
        config.public_base_url = Some("https://ledger.example".into());
    })
    .await
}

fn sign(body: &[u8]) -> String {
    hmac_sha256_hex(SECRET.as_bytes(), body).unwrap()
}

/// Submit a music job whose task stays pending until a callback lands.
async fn pending_job(harness: &TestHarness, task_id: &str) -> (dua_ledger_core::UserId, String) {
    let user_id = harness.funded_user(50).await;
    harness.suno_accepts(task_id).await;
    harness.suno_status(task_id, "PENDING", None).await;

    let body: Value = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await
        .json();
    (user_id, body["jobId"].as_str().unwrap().to_string())
}

async fn post_callback(
    harness: &TestHarness,
    provider: &str,
    body: &Value,
    signature: Option<String>,
) -> axum_test::TestResponse {
    let raw = serde_json::to_vec(body).unwrap();
    let mut request = harness
        .server
        .post(&format!("/webhooks/{provider}"))
        .content_type("application/json");
    if let Some(signature) = signature {
        request = request.add_header(SIGNATURE_HEADER, signature);
    }
    request.bytes(Bytes::from(raw)).await
}

async fn post_signed(harness: &TestHarness, body: &Value) -> axum_test::TestResponse {
    let signature = sign(&serde_json::to_vec(body).unwrap());
    post_callback(harness, "suno", body, Some(signature)).await
}

// ============================================================================
// Signatures
// ============================================================================

#[tokio::test]
async fn signed_completion_callback_settles_job() {
    let harness = signed_harness().await;
    let (user_id, job_id) = pending_job(&harness, "cb-task-1").await;

    let response = post_signed(&harness, &suno_callback("cb-task-1", "complete")).await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["received"], true);
    assert_eq!(body["jobId"], job_id);
    assert_eq!(body["state"], "SUCCEEDED");
    assert_eq!(body["changed"], true);

    let job = harness.wait_settled(&job_id).await;
    assert_eq!(job["resultPayload"][0]["audio_url"], "https://cdn.example/track.mp3");
    assert_eq!(harness.balance(&user_id).await, 44);
}

#[tokio::test]
async fn invalid_signature_is_rejected() {
    let harness = signed_harness().await;
    let (_, job_id) = pending_job(&harness, "cb-task-2").await;

    let response = post_callback(
        &harness,
        "suno",
        &suno_callback("cb-task-2", "complete"),
        Some("deadbeef".repeat(8)),
    )
    .await;

    response.assert_status_unauthorized();
    assert_eq!(harness.job(&job_id).await["state"], "SUBMITTED");
}

#[tokio::test]
async fn missing_signature_is_rejected() {
    let harness = signed_harness().await;
    let (_, job_id) = pending_job(&harness, "cb-task-3").await;

    let response =
        post_callback(&harness, "suno", &suno_callback("cb-task-3", "complete"), None).await;

    response.assert_status_unauthorized();
    assert_eq!(harness.job(&job_id).await["state"], "SUBMITTED");
}

#[tokio::test]
async fn unsigned_callbacks_accepted_without_secret() {
    let harness = TestHarness::new().await;
    let (_, job_id) = pending_job(&harness, "cb-task-4").await;

    let response =
        post_callback(&harness, "suno", &suno_callback("cb-task-4", "text"), None).await;

    response.assert_status_ok();
    assert_eq!(harness.job(&job_id).await["state"], "TEXT_READY");
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn replayed_callback_is_idempotent() {
    let harness = signed_harness().await;
    let (user_id, job_id) = pending_job(&harness, "cb-task-5").await;
    let callback = suno_callback("cb-task-5", "error");

    let first: Value = post_signed(&harness, &callback).await.json();
    assert_eq!(first["state"], "FAILED");
    assert_eq!(first["changed"], true);

    let replay = post_signed(&harness, &callback).await;
    replay.assert_status_ok();
    let replay: Value = replay.json();
    assert_eq!(replay["state"], "FAILED");
    assert_eq!(replay["changed"], false);

    harness.wait_settled(&job_id).await;
    assert_eq!(harness.balance(&user_id).await, 50);
    let refunds = harness
        .transactions(&user_id)
        .await
        .into_iter()
        .filter(|tx| tx["kind"] == "refund")
        .count();
    assert_eq!(refunds, 1);
}

#[tokio::test]
async fn late_callback_cannot_reopen_terminal_job() {
    let harness = signed_harness().await;
    let (user_id, job_id) = pending_job(&harness, "cb-task-6").await;

    post_signed(&harness, &suno_callback("cb-task-6", "complete"))
        .await
        .assert_status_ok();
    let late: Value = post_signed(&harness, &suno_callback("cb-task-6", "error"))
        .await
        .json();

    assert_eq!(late["state"], "SUCCEEDED");
    assert_eq!(late["changed"], false);
    harness.wait_settled(&job_id).await;
    assert_eq!(harness.balance(&user_id).await, 44);
}

#[tokio::test]
async fn concurrent_failure_reports_refund_once() {
    let harness = signed_harness().await;
    let user_id = harness.funded_user(50).await;
    harness.suno_accepts("cb-task-7").await;
    // The poller sees the failure too
    harness
        .suno_status("cb-task-7", "GENERATE_AUDIO_FAILED", None)
        .await;

    let body: Value = harness
        .submit(&user_id, "music_generate_v5", music_params())
        .await
        .json();
    let job_id = body["jobId"].as_str().unwrap();

    let callback = suno_callback("cb-task-7", "error");
    let (a, b) = tokio::join!(
        post_signed(&harness, &callback),
        post_signed(&harness, &callback)
    );
    a.assert_status_ok();
    b.assert_status_ok();

    let job = harness.wait_settled(job_id).await;
    assert_eq!(job["state"], "FAILED");
    assert_eq!(harness.balance(&user_id).await, 50);
    let refunds = harness
        .transactions(&user_id)
        .await
        .into_iter()
        .filter(|tx| tx["kind"] == "refund")
        .count();
    assert_eq!(refunds, 1);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn callback_for_unknown_task_is_not_found() {
    let harness = signed_harness().await;

    let response = post_signed(&harness, &suno_callback("no-such-task", "complete")).await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn callback_for_unknown_provider_is_not_found() {
    let harness = signed_harness().await;
    let body = suno_callback("cb-task-8", "complete");
    let signature = sign(&serde_json::to_vec(&body).unwrap());

    let response = post_callback(&harness, "midjourney", &body, Some(signature)).await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn malformed_callback_is_bad_request() {
    let harness = signed_harness().await;
    let body = serde_json::json!({ "code": 200, "data": { "callbackType": "complete" } });

    let response = post_signed(&harness, &body).await;

    response.assert_status_bad_request();
}
