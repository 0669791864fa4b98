//! Balance, transaction history and admin integration tests.

mod common;

use common::TestHarness;
use serde_json::{json, Value};

use dua_ledger_core::UserId;

// ============================================================================
// Accounts
// ============================================================================

#[tokio::test]
async fn create_account_records_opening_grant() {
    let harness = TestHarness::new().await;
    let user_id = UserId::generate();

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", &harness.service_api_key)
        .json(&json!({ "userId": user_id.to_string(), "initialUnits": 25 }))
        .await;

    response.assert_status(axum::http::StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["userId"], user_id.to_string());
    assert_eq!(body["units"], 25);
    assert_eq!(body["mirrorUnits"], 25);

    let transactions = harness.transactions(&user_id).await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["kind"], "credit");
    assert_eq!(transactions[0]["balanceAfter"], 25);
}

#[tokio::test]
async fn create_account_twice_conflicts() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", &harness.service_api_key)
        .json(&json!({ "userId": user_id.to_string(), "initialUnits": 10 }))
        .await;

    response.assert_status(axum::http::StatusCode::CONFLICT);
    assert_eq!(harness.balance(&user_id).await, 10);
}

#[tokio::test]
async fn negative_opening_balance_is_rejected() {
    let harness = TestHarness::new().await;

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", &harness.service_api_key)
        .json(&json!({ "userId": UserId::generate().to_string(), "initialUnits": -5 }))
        .await;

    response.assert_status_bad_request();
}

// ============================================================================
// Balance
// ============================================================================

#[tokio::test]
async fn balance_of_unknown_user_is_not_found() {
    let harness = TestHarness::new().await;

    let response = harness
        .server
        .get("/v1/balance")
        .add_query_param("userId", UserId::generate().to_string())
        .add_header("x-api-key", &harness.service_api_key)
        .await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn balance_requires_service_key() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    harness
        .server
        .get("/v1/balance")
        .add_query_param("userId", user_id.to_string())
        .await
        .assert_status_unauthorized();

    harness
        .server
        .get("/v1/balance")
        .add_query_param("userId", user_id.to_string())
        .add_header("x-api-key", "wrong-key")
        .await
        .assert_status_unauthorized();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn transactions_paginate_newest_first() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    for units in [1, 2, 3] {
        harness
            .server
            .post("/v1/admin/credits")
            .add_header("x-admin-key", &harness.admin_api_key)
            .json(&json!({ "userId": user_id.to_string(), "units": units }))
            .await
            .assert_status_ok();
    }

    let response = harness
        .server
        .get("/v1/transactions")
        .add_query_param("userId", user_id.to_string())
        .add_query_param("limit", 2)
        .add_header("x-api-key", &harness.service_api_key)
        .await;
    response.assert_status_ok();
    let page: Value = response.json();
    assert_eq!(page["hasMore"], true);
    let deltas: Vec<i64> = page["transactions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tx| tx["amountDelta"].as_i64().unwrap())
        .collect();
    assert_eq!(deltas, vec![3, 2]);

    let response = harness
        .server
        .get("/v1/transactions")
        .add_query_param("userId", user_id.to_string())
        .add_query_param("limit", 2)
        .add_query_param("offset", 2)
        .add_header("x-api-key", &harness.service_api_key)
        .await;
    let page: Value = response.json();
    assert_eq!(page["hasMore"], false);
    assert_eq!(page["transactions"][0]["amountDelta"], 1);
    assert_eq!(page["transactions"][1]["amountDelta"], 10);
    assert_eq!(page["transactions"][0]["balanceAfter"], 11);
}

#[tokio::test]
async fn transactions_require_user_id() {
    let harness = TestHarness::new().await;

    harness
        .server
        .get("/v1/transactions")
        .add_header("x-api-key", &harness.service_api_key)
        .await
        .assert_status_bad_request();
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn admin_routes_require_admin_key() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-api-key", &harness.service_api_key)
        .json(&json!({ "userId": user_id.to_string(), "units": 5 }))
        .await
        .assert_status_unauthorized();

    assert_eq!(harness.balance(&user_id).await, 10);
}

#[tokio::test]
async fn admin_grant_credits() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    let response = harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", &harness.admin_api_key)
        .add_header("x-admin-id", "ops@dua")
        .json(&json!({ "userId": user_id.to_string(), "units": 15, "reason": "support" }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["transaction"]["kind"], "credit");
    assert_eq!(body["transaction"]["reason"], "support");
    assert_eq!(body["balance"]["units"], 25);
    assert_eq!(harness.balance(&user_id).await, 25);
}

#[tokio::test]
async fn admin_grant_rejects_non_positive_units() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&json!({ "userId": user_id.to_string(), "units": 0 }))
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn admin_grant_above_cap_is_rejected_and_ledger_keeps_working() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&json!({ "userId": user_id.to_string(), "units": i64::MAX }))
        .await
        .assert_status_bad_request();

    assert_eq!(harness.balance(&user_id).await, 10);
    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&json!({ "userId": user_id.to_string(), "units": 5 }))
        .await
        .assert_status_ok();
    assert_eq!(harness.balance(&user_id).await, 15);
}

#[tokio::test]
async fn admin_set_balance_records_adjustment() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(40).await;

    let response = harness
        .server
        .post("/v1/admin/balance")
        .add_header("x-admin-key", &harness.admin_api_key)
        .add_header("x-admin-id", "ops@dua")
        .json(&json!({ "userId": user_id.to_string(), "units": 15 }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["transaction"]["kind"], "adjustment");
    assert_eq!(body["transaction"]["amountDelta"], -25);
    assert_eq!(body["balance"]["units"], 15);
    assert_eq!(body["balance"]["mirrorUnits"], 15);
}

#[tokio::test]
async fn mirror_write_propagates_to_primary() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(40).await;

    let response = harness
        .server
        .post("/v1/admin/mirror")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&json!({ "userId": user_id.to_string(), "units": 70 }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["balance"]["units"], 70);
    assert_eq!(body["balance"]["mirrorUnits"], 70);
    assert_eq!(harness.balance(&user_id).await, 70);

    let response = harness
        .server
        .post(&format!("/v1/admin/reconcile/{user_id}"))
        .add_header("x-admin-key", &harness.admin_api_key)
        .await;
    response.assert_status_ok();
    let outcome: Value = response.json();
    assert_eq!(outcome["status"], "in_sync");
    assert_eq!(outcome["units"], 70);
}

#[tokio::test]
async fn reconcile_rejects_bad_user_id() {
    let harness = TestHarness::new().await;

    harness
        .server
        .post("/v1/admin/reconcile/not-a-uuid")
        .add_header("x-admin-key", &harness.admin_api_key)
        .await
        .assert_status_bad_request();
}

// ============================================================================
// Synchronous credits
// ============================================================================

async fn deduct(
    harness: &TestHarness,
    user_id: &UserId,
    operation: &str,
) -> axum_test::TestResponse {
    harness
        .server
        .post("/v1/credits/deduct")
        .add_header("x-api-key", &harness.service_api_key)
        .json(&json!({ "userId": user_id.to_string(), "operation": operation }))
        .await
}

#[tokio::test]
async fn deduct_charges_catalog_cost() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;

    let response = deduct(&harness, &user_id, "image_standard").await;

    response.assert_status_ok();
    assert_eq!(response.header("x-credits-balance").to_str().unwrap(), "75");
    assert_eq!(response.header("x-credits-deducted").to_str().unwrap(), "25");
    let body: Value = response.json();
    assert_eq!(body["cost"], 25);
    assert_eq!(body["balance"], 75);
    assert!(body["transactionId"].is_string());

    assert_eq!(harness.balance(&user_id).await, 75);
    let transactions = harness.transactions(&user_id).await;
    assert_eq!(transactions[0]["kind"], "deduction");
    assert_eq!(transactions[0]["reason"], "image_standard");
    assert_eq!(transactions[0]["amountDelta"], -25);
}

#[tokio::test]
async fn deduct_without_funds_is_payment_required() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(10).await;

    let response = deduct(&harness, &user_id, "image_ultra").await;

    response.assert_status(axum::http::StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "insufficient_funds");
    assert_eq!(body["error"]["details"]["balance"], 10);
    assert_eq!(body["error"]["details"]["required"], 35);
    assert_eq!(harness.balance(&user_id).await, 10);
    assert_eq!(harness.transactions(&user_id).await.len(), 1);
}

#[tokio::test]
async fn free_operation_records_nothing() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(5).await;

    let response = deduct(&harness, &user_id, "chat_basic").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["cost"], 0);
    assert_eq!(body["balance"], 5);
    assert!(body.get("transactionId").is_none());
    assert_eq!(harness.transactions(&user_id).await.len(), 1);
}

#[tokio::test]
async fn deduct_refuses_job_services_and_unknown_users() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;

    deduct(&harness, &user_id, "music_generate_v5")
        .await
        .assert_status_bad_request();
    deduct(&harness, &UserId::generate(), "image_fast")
        .await
        .assert_status_not_found();
    assert_eq!(harness.balance(&user_id).await, 100);
}

#[tokio::test]
async fn check_reports_deficit() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(40).await;

    let check = |operation: &'static str, user: UserId| {
        harness
            .server
            .get("/v1/credits/check")
            .add_query_param("userId", user.to_string())
            .add_query_param("operation", operation)
            .add_header("x-api-key", &harness.service_api_key)
    };

    let body: Value = check("music_split_stem_full", user_id).await.json();
    assert_eq!(body["required"], 50);
    assert_eq!(body["balance"], 40);
    assert_eq!(body["deficit"], 10);
    assert_eq!(body["hasCredits"], false);

    let body: Value = check("music_generate_v5", user_id).await.json();
    assert_eq!(body["hasCredits"], true);
    assert_eq!(body["deficit"], 0);

    let body: Value = check("chat_basic", UserId::generate()).await.json();
    assert_eq!(body["balance"], 0);
    assert_eq!(body["isFree"], true);
    assert_eq!(body["hasCredits"], true);

    check("not_a_code", user_id).await.assert_status_bad_request();
}

#[tokio::test]
async fn stats_total_spending() {
    let harness = TestHarness::new().await;
    let user_id = harness.funded_user(100).await;
    deduct(&harness, &user_id, "image_standard").await.assert_status_ok();
    deduct(&harness, &user_id, "chat_advanced").await.assert_status_ok();
    deduct(&harness, &user_id, "chat_basic").await.assert_status_ok();

    let response = harness
        .server
        .get("/v1/credits/stats")
        .add_query_param("userId", user_id.to_string())
        .add_header("x-api-key", &harness.service_api_key)
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["totalSpent"], 26);
    assert_eq!(body["totalRefunded"], 0);
    assert_eq!(body["transactionCount"], 3);
    assert_eq!(body["lastTransaction"]["reason"], "chat_advanced");
}

#[tokio::test]
async fn operations_are_listed() {
    let harness = TestHarness::new().await;

    let body: Value = harness
        .server
        .get("/v1/credits/operations")
        .add_header("x-api-key", &harness.service_api_key)
        .await
        .json();

    let operations = body.as_array().unwrap();
    let logo = operations
        .iter()
        .find(|op| op["code"] == "design_generate_logo")
        .unwrap();
    assert_eq!(logo["cost"], 6);
    assert_eq!(logo["category"], "design_studio");
    assert!(operations.iter().all(|op| op["code"] != "music_generate_v5"));
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn health_check() {
    let harness = TestHarness::new().await;

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "dua-ledger");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["providers"], json!(["runway", "suno"]));
    assert_eq!(body["trackedJobs"], 0);
}

#[tokio::test]
async fn health_lists_only_configured_providers() {
    let harness = TestHarness::with_config(|config| config.runway.api_key = None).await;

    let body: Value = harness.server.get("/health").await.json();

    assert_eq!(body["providers"], json!(["suno"]));
}
