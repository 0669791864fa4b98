//! Invite code integration tests.

mod common;

use common::TestHarness;
use serde_json::{json, Value};

use dua_ledger_core::UserId;

async fn issue(harness: &TestHarness, body: Value) -> Vec<String> {
    let response = harness
        .server
        .post("/v1/admin/invites")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&body)
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    body["codes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect()
}

async fn redeem(harness: &TestHarness, code: &str, user_id: &UserId) -> axum_test::TestResponse {
    harness
        .server
        .post("/v1/invites/redeem")
        .add_header("x-api-key", &harness.service_api_key)
        .json(&json!({ "code": code, "userId": user_id.to_string() }))
        .await
}

#[tokio::test]
async fn redeem_credits_new_user() {
    let harness = TestHarness::with_config(|config| config.invite_welcome_units = 30).await;
    let codes = issue(&harness, json!({ "codes": ["launch-party"] })).await;
    assert_eq!(codes, vec!["LAUNCH-PARTY"]);

    let user_id = UserId::generate();
    let response = redeem(&harness, "  launch-party ", &user_id).await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["code"], "LAUNCH-PARTY");
    assert_eq!(body["creditedUnits"], 30);
    assert_eq!(body["balance"], 30);
    assert_eq!(harness.balance(&user_id).await, 30);
}

#[tokio::test]
async fn redeem_adds_to_existing_balance() {
    let harness = TestHarness::with_config(|config| config.invite_welcome_units = 30).await;
    issue(&harness, json!({ "codes": ["FRIEND"] })).await;
    let user_id = harness.funded_user(12).await;

    let body: Value = redeem(&harness, "friend", &user_id).await.json();

    assert_eq!(body["balance"], 42);
    let transactions = harness.transactions(&user_id).await;
    assert_eq!(transactions[0]["reason"], "invite:FRIEND");
}

#[tokio::test]
async fn code_is_single_use() {
    let harness = TestHarness::new().await;
    issue(&harness, json!({ "codes": ["ONCE-ONLY"] })).await;

    redeem(&harness, "ONCE-ONLY", &UserId::generate())
        .await
        .assert_status_ok();
    let second = redeem(&harness, "ONCE-ONLY", &UserId::generate()).await;

    second.assert_status(axum::http::StatusCode::CONFLICT);
    let body: Value = second.json();
    assert_eq!(body["error"]["code"], "invite_already_used");
}

#[tokio::test]
async fn concurrent_redemption_has_one_winner() {
    let harness = TestHarness::new().await;
    issue(&harness, json!({ "codes": ["RACE-CODE"] })).await;
    let users: Vec<UserId> = (0..4).map(|_| UserId::generate()).collect();

    let responses =
        futures::future::join_all(users.iter().map(|user| redeem(&harness, "RACE-CODE", user)))
            .await;

    let mut statuses: Vec<u16> = responses
        .iter()
        .map(|r| r.status_code().as_u16())
        .collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 409, 409, 409]);
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let harness = TestHarness::new().await;

    redeem(&harness, "NOPE-NOPE", &UserId::generate())
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn blank_code_is_bad_request() {
    let harness = TestHarness::new().await;

    redeem(&harness, "   ", &UserId::generate())
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn generated_codes_are_unique_and_prefixed() {
    let harness = TestHarness::new().await;

    let codes = issue(&harness, json!({ "count": 5, "prefix": "beta" })).await;

    assert_eq!(codes.len(), 5);
    assert!(codes.iter().all(|c| c.starts_with("BETA-")));
    let mut unique = codes.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 5);
}

#[tokio::test]
async fn existing_codes_are_not_reissued() {
    let harness = TestHarness::new().await;
    issue(&harness, json!({ "codes": ["DUP-CODE"] })).await;

    let codes = issue(&harness, json!({ "codes": ["dup-code", "fresh-code"] })).await;

    assert_eq!(codes, vec!["FRESH-CODE"]);
}

#[tokio::test]
async fn oversized_or_empty_batches_are_rejected() {
    let harness = TestHarness::new().await;

    for body in [json!({ "count": 501 }), json!({})] {
        harness
            .server
            .post("/v1/admin/invites")
            .add_header("x-admin-key", &harness.admin_api_key)
            .json(&body)
            .await
            .assert_status_bad_request();
    }
}
