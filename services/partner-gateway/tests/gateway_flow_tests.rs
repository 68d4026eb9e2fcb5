// Partner inquiry and payment forwarding against a mocked parking location

mod common;

use common::*;
use gateway_core::codec::{InquiryFields, PaymentFields, Signable};
use gateway_core::{GatewayResponse, Rejection};
use httpmock::prelude::*;
use partner_gateway::services::{GatewayService, ServiceContext};
use serde_json::{json, Value};
use std::sync::Arc;

const TX: &str = "123456789012F007SK";

fn inquiry_request(signature_secret: &str, store_id: &str) -> Value {
    let signature = InquiryFields {
        login: PAYER_LOGIN,
        password: PAYER_PASSWORD,
        store_id,
        transaction_no: TX,
    }
    .sign(signature_secret);
    json!({
        "login": PAYER_LOGIN,
        "password": PAYER_PASSWORD,
        "storeID": store_id,
        "transactionNo": TX,
        "signature": signature,
    })
}

fn payment_request(amount: &str) -> Value {
    let signature = PaymentFields {
        login: PAYER_LOGIN,
        password: PAYER_PASSWORD,
        store_id: LOCATION_NMID,
        transaction_no: TX,
        reference_no: "REF-1",
        amount,
        payment_status: "PAID",
        payment_reference_no: "PAYREF-1",
        payment_date: "2024-05-01 10:05:00",
        issuer_id: "ISSUER",
        retrieval_reference_no: "RRN-1",
        approval_code: "APPROVE",
    }
    .sign(PAYER_SECRET);
    json!({
        "login": PAYER_LOGIN,
        "password": PAYER_PASSWORD,
        "storeID": LOCATION_NMID,
        "transactionNo": TX,
        "referenceNo": "REF-1",
        "amount": amount,
        "paymentStatus": "PAID",
        "paymentReferenceNo": "PAYREF-1",
        "paymentDate": "2024-05-01 10:05:00",
        "issuerID": "ISSUER",
        "retrievalReferenceNo": "RRN-1",
        "approvalCode": "APPROVE",
        "signature": signature,
    })
}

fn location_bill(tariff: i64, payment_status: &str) -> Value {
    json!({
        "responseStatus": "Success",
        "responseCode": "211000",
        "responseDescription": "Transaction Success",
        "messageDetail": "Ticket is valid, please continue for payment",
        "data": {
            "transactionNo": TX,
            "transactionStatus": "VALID",
            "tariff": tariff,
            "paymentStatus": payment_status,
        }
    })
}

struct Harness {
    store: Arc<MemoryStore>,
    ctx: ServiceContext,
    service: GatewayService,
}

fn harness(server: &MockServer) -> Harness {
    let store = Arc::new(MemoryStore::seeded(&server.base_url()));
    let clock = manual_clock();
    let ctx = context(store.clone(), clock.clone());
    let service = GatewayService::new(ctx.clone(), test_client("downstream", clock));
    Harness { store, ctx, service }
}

impl Harness {
    /// Location reply sealed with the location key
    async fn location_reply(&self, body: &Value) -> Value {
        let sealed = seal(&self.ctx, body, LOCATION_GIBBERISH).await;
        json!({ "data": sealed.data })
    }
}

#[tokio::test]
async fn test_inquiry_is_relayed_and_logged() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let reply = h.location_reply(&location_bill(10000, "UNPAID")).await;
    let inquiry = server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(200).json_body(reply);
        })
        .await;

    let body = seal(&h.ctx, &inquiry_request(PAYER_SECRET, LOCATION_NMID), PARTNER_KEY).await;
    let sealed = h.service.inquiry(&body).await.unwrap();

    assert!(!sealed.is_rejected());
    let response: GatewayResponse = open(&h.ctx, &sealed.payload, PAYER_GIBBERISH).await;
    assert_eq!(response.response_code, "211000");
    assert_eq!(response.data["tariff"], 10000);

    inquiry.assert_hits_async(1).await;
    let logs = h.store.inquiry_logs.lock();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].store_code, "007SK");
    assert_eq!(logs[0].nmid, LOCATION_NMID);
}

#[tokio::test]
async fn test_unknown_store_is_rejected_before_forwarding() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let inquiry = server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(200);
        })
        .await;

    let body = seal(&h.ctx, &inquiry_request(PAYER_SECRET, "ID-UNKNOWN"), PARTNER_KEY).await;
    let sealed = h.service.inquiry(&body).await.unwrap();

    assert_eq!(sealed.rejection, Some(Rejection::InvalidLocation));
    let response: GatewayResponse = open(&h.ctx, &sealed.payload, PAYER_GIBBERISH).await;
    assert_eq!(response.message_detail, "Invalid Location Parking");
    assert_eq!(response.data["transactionNo"], TX);
    inquiry.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_tampered_signature_is_rejected() {
    let server = MockServer::start_async().await;
    let h = harness(&server);

    let body = seal(&h.ctx, &inquiry_request("not-the-secret", LOCATION_NMID), PARTNER_KEY).await;
    let sealed = h.service.inquiry(&body).await.unwrap();

    assert_eq!(sealed.rejection, Some(Rejection::InvalidSignature));
    assert_eq!(sealed.response_code, "211080");
    assert!(h.store.inquiry_logs.lock().is_empty());
}

#[tokio::test]
async fn test_unknown_partner_answers_under_shared_key() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let mut request = inquiry_request(PAYER_SECRET, LOCATION_NMID);
    request["password"] = json!("wrong");

    let body = seal(&h.ctx, &request, PARTNER_KEY).await;
    let sealed = h.service.inquiry(&body).await.unwrap();

    assert_eq!(sealed.rejection, Some(Rejection::InvalidCredential));
    let response: GatewayResponse = open(&h.ctx, &sealed.payload, PARTNER_KEY).await;
    assert_eq!(response.response_code, "911006");
}

#[tokio::test]
async fn test_missing_envelope_is_rejected() {
    let server = MockServer::start_async().await;
    let h = harness(&server);

    let sealed = h.service.inquiry(&Default::default()).await.unwrap();
    assert_eq!(sealed.rejection, Some(Rejection::MissingEnvelope));
}

#[tokio::test]
async fn test_payment_amount_mismatch_never_reaches_payment() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let reply = h.location_reply(&location_bill(10000, "UNPAID")).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(200).json_body(reply);
        })
        .await;
    let payment = server
        .mock_async(|when, then| {
            when.method(POST).path("/post/payment");
            then.status(200);
        })
        .await;

    let body = seal(&h.ctx, &payment_request("5000"), PARTNER_KEY).await;
    let sealed = h.service.payment_confirmation(&body).await.unwrap();

    assert_eq!(sealed.rejection, Some(Rejection::InvalidAmount));
    payment.assert_hits_async(0).await;
    assert!(h.store.payment_logs.lock().is_empty());
}

#[tokio::test]
async fn test_blank_payment_field_counts_as_missing() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let inquiry = server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(200);
        })
        .await;
    let mut request = payment_request("10000");
    request["approvalCode"] = json!("");

    let body = seal(&h.ctx, &request, PARTNER_KEY).await;
    let sealed = h.service.payment_confirmation(&body).await.unwrap();

    assert_eq!(sealed.rejection, Some(Rejection::MissingFields));
    let response: GatewayResponse = open(&h.ctx, &sealed.payload, PARTNER_KEY).await;
    assert_eq!(response.response_code, "211080");
    assert_eq!(response.data["transactionNo"], TX);
    inquiry.assert_hits_async(0).await;
    assert!(h.store.payment_logs.lock().is_empty());
}

#[tokio::test]
async fn test_payment_is_confirmed_and_logged() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let bill = h.location_reply(&location_bill(10000, "UNPAID")).await;
    let paid = h
        .location_reply(&json!({
            "responseStatus": "Success",
            "responseCode": "211000",
            "responseDescription": "Transaction Success",
            "messageDetail": "Paid",
            "data": { "transactionNo": TX, "paymentStatus": "PAID" }
        }))
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(200).json_body(bill);
        })
        .await;
    let payment = server
        .mock_async(|when, then| {
            when.method(POST).path("/post/payment");
            then.status(200).json_body(paid);
        })
        .await;

    let body = seal(&h.ctx, &payment_request("10000"), PARTNER_KEY).await;
    let sealed = h.service.payment_confirmation(&body).await.unwrap();

    assert!(!sealed.is_rejected());
    let response: GatewayResponse = open(&h.ctx, &sealed.payload, PAYER_GIBBERISH).await;
    assert!(response.is_success());
    // exit window is 30 minutes after 10:00 WIB
    assert!(response.message_detail.contains("2024-05-01 10:30:00"), "{}", response.message_detail);

    payment.assert_hits_async(1).await;
    let logs = h.store.payment_logs.lock();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].amount, "10000");
    assert_eq!(logs[0].created_by, LOCATION_LOGIN);
}

#[tokio::test]
async fn test_already_paid_bill_is_refused() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let reply = h.location_reply(&location_bill(0, "PAID")).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(200).json_body(reply);
        })
        .await;

    let body = seal(&h.ctx, &payment_request("0"), PARTNER_KEY).await;
    let sealed = h.service.payment_confirmation(&body).await.unwrap();

    assert_eq!(sealed.rejection, Some(Rejection::BillAlreadyPaid));
    let response: GatewayResponse = open(&h.ctx, &sealed.payload, PAYER_GIBBERISH).await;
    assert_eq!(response.data["paymentStatus"], "PAID");
}

#[tokio::test]
async fn test_failing_location_opens_the_circuit() {
    let server = MockServer::start_async().await;
    let h = harness(&server);
    let inquiry = server
        .mock_async(|when, then| {
            when.method(POST).path("/post/inquiry");
            then.status(500);
        })
        .await;

    for _ in 0..3 {
        let body = seal(&h.ctx, &inquiry_request(PAYER_SECRET, LOCATION_NMID), PARTNER_KEY).await;
        let sealed = h.service.inquiry(&body).await.unwrap();
        assert_eq!(sealed.rejection, Some(Rejection::DownstreamUnavailable));
        assert_eq!(sealed.response_code, "211503");
    }

    // the third call is refused by the open circuit
    inquiry.assert_hits_async(2).await;
    assert!(h.store.inquiry_logs.lock().is_empty());
}
