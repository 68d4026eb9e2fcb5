// Auto-entry membership check against a mocked membership system

mod common;

use common::*;
use gateway_core::codec::{AutoEntryFields, Signable};
use gateway_core::{GatewayResponse, Rejection};
use httpmock::prelude::*;
use partner_gateway::config::AutoEntryConfig;
use partner_gateway::services::{AutoEntryService, ServiceContext};
use serde_json::{json, Value};
use std::sync::Arc;

const TX: &str = "987654321098F007SK";
const PLATE: &str = "B9999ZZ";

fn auto_entry_request(secret: &str) -> Value {
    let signature = AutoEntryFields {
        login: LOCATION_LOGIN,
        password: LOCATION_PASSWORD,
        transaction_no: TX,
        license_plate_no: PLATE,
        location_code: LOCATION_STORE_CODE,
    }
    .sign(secret);
    json!({
        "login": LOCATION_LOGIN,
        "password": LOCATION_PASSWORD,
        "transactionNo": TX,
        "licensePlateNo": PLATE,
        "locationCode": LOCATION_STORE_CODE,
        "signature": signature,
    })
}

struct Harness {
    store: Arc<MemoryStore>,
    ctx: ServiceContext,
    service: AutoEntryService,
}

fn harness(server: &MockServer) -> Harness {
    let store = Arc::new(MemoryStore::seeded(&server.base_url()));
    let clock = manual_clock();
    let ctx = context(store.clone(), clock.clone());
    let settings = AutoEntryConfig {
        token_url: server.url("/oauth/token"),
        membership_url: server.url("/membership/check"),
        grant_type: "password".to_string(),
        username: "gateway".to_string(),
        password: "gateway-pass".to_string(),
        ticket_url_base: "https://ebilling.example.com/ticket".to_string(),
        timeout_secs: 3,
    };
    let service = AutoEntryService::new(ctx.clone(), test_client("membership", clock), settings);
    Harness { store, ctx, service }
}

impl Harness {
    async fn check(&self, request: &Value) -> (Option<Rejection>, GatewayResponse) {
        let body = seal(&self.ctx, request, PARTNER_KEY).await;
        let sealed = self.service.check(&body).await.unwrap();
        (sealed.rejection, open(&self.ctx, &sealed.payload, LOCATION_GIBBERISH).await)
    }
}

async fn token_endpoint(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .body_contains("grant_type=password");
            then.status(200).json_body(json!({"access_token": "tok-1", "token_type": "bearer"}));
        })
        .await;
}

#[tokio::test]
async fn test_member_plate_is_valid() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    token_endpoint(&server).await;
    let lookup = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/membership/check")
                .header("authorization", "Bearer tok-1")
                .json_body_partial(r#"{"LicenseNumber": "B9999ZZ", "Location": "Mall Parking"}"#);
            then.status(200).json_body(json!({"Code": "200", "EmailHide": "dr***@mail.com"}));
        })
        .await;

    let (rejection, response) = h.check(&auto_entry_request(LOCATION_SECRET)).await;

    assert_eq!(rejection, None);
    assert_eq!(response.response_code, "211000");
    assert_eq!(response.data["status"], "VALID");
    assert_eq!(response.data["customerEmail"], "dr***@mail.com");
    lookup.assert_hits_async(1).await;

    let logs = h.store.membership_logs.lock();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].response_status);
    assert_eq!(
        logs[0].qr_ticket,
        format!("https://ebilling.example.com/ticket?p1={LOCATION_NMID}&p2={TX}")
    );
}

#[tokio::test]
async fn test_unknown_plate_is_not_member() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    token_endpoint(&server).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/membership/check");
            then.status(404).json_body(json!({"Code": 404, "Message": "Not Found"}));
        })
        .await;

    let (_, response) = h.check(&auto_entry_request(LOCATION_SECRET)).await;

    assert_eq!(response.response_code, "211170");
    assert_eq!(response.response_description, "Membership Data Is Not Found");
    assert_eq!(response.data["status"], "INVALID");
    assert!(!h.store.membership_logs.lock()[0].response_status);
}

#[tokio::test]
async fn test_token_failure_skips_lookup() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200).json_body(json!({"error": "invalid_grant"}));
        })
        .await;
    let lookup = server
        .mock_async(|when, then| {
            when.method(POST).path("/membership/check");
            then.status(200);
        })
        .await;

    let (_, response) = h.check(&auto_entry_request(LOCATION_SECRET)).await;

    assert_eq!(response.response_description, "Error Establish Connection");
    lookup.assert_hits_async(0).await;
    assert!(h.store.membership_logs.lock().is_empty());
}

#[tokio::test]
async fn test_bad_signature_is_rejected_under_location_key() {
    let server = MockServer::start_async().await;
    let h = harness(&server);

    let (rejection, response) = h.check(&auto_entry_request("wrong-secret")).await;

    assert_eq!(rejection, Some(Rejection::InvalidSignature));
    assert_eq!(response.data["transactionNo"], TX);
}
