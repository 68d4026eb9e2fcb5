// Gateway-hosted ticketing: issue, inquiry, payment and close

mod common;

use chrono::Duration;
use common::*;
use gateway_core::codec::{InquiryFields, PaymentFields, Signable};
use gateway_core::{GatewayResponse, ManualClock, Rejection, Ticket, TicketStatus, VehicleType};
use partner_gateway::config::TicketingConfig;
use partner_gateway::services::{ServiceContext, TicketingService};
use serde_json::{json, Value};
use std::sync::Arc;

const TX: &str = "000011112222F007SK";

fn settings() -> TicketingConfig {
    TicketingConfig {
        location_name: "Mall Parking".to_string(),
        store_id: LOCATION_NMID.to_string(),
        location_code: LOCATION_STORE_CODE.to_string(),
        ticket_url_base: "https://ebilling.example.com/ticket".to_string(),
        default_grace_minutes: 5,
        max_update_attempts: 3,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    ctx: ServiceContext,
    ticketing: TicketingService,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::seeded("http://127.0.0.1:9"));
    let clock = manual_clock();
    let ctx = context(store.clone(), clock.clone());
    let ticketing = TicketingService::new(ctx.clone(), settings());
    Harness {
        store,
        clock,
        ctx,
        ticketing,
    }
}

impl Harness {
    /// Ticket that entered `minutes_ago` with a five-minute grace period
    fn parked(&self, minutes_ago: i64) {
        let entered = start_of_test() - Duration::minutes(minutes_ago);
        self.store
            .put_ticket(Ticket::issue(TX, 5, VehicleType::Mobil, entered));
    }

    async fn inquiry(&self) -> (Option<Rejection>, GatewayResponse) {
        let signature = InquiryFields {
            login: PAYER_LOGIN,
            password: PAYER_PASSWORD,
            store_id: LOCATION_NMID,
            transaction_no: TX,
        }
        .sign(PAYER_SECRET);
        let body = seal(
            &self.ctx,
            &json!({
                "login": PAYER_LOGIN,
                "password": PAYER_PASSWORD,
                "storeID": LOCATION_NMID,
                "transactionNo": TX,
                "signature": signature,
            }),
            PARTNER_KEY,
        )
        .await;
        let sealed = self.ticketing.inquiry(&body).await.unwrap();
        (sealed.rejection, open(&self.ctx, &sealed.payload, PARTNER_KEY).await)
    }

    async fn pay(&self, amount: &str) -> (Option<Rejection>, GatewayResponse) {
        let signature = PaymentFields {
            login: PAYER_LOGIN,
            password: PAYER_PASSWORD,
            store_id: LOCATION_NMID,
            transaction_no: TX,
            reference_no: "REF-7",
            amount,
            payment_status: "PAID",
            payment_reference_no: "PAYREF-7",
            payment_date: "2024-05-01 10:00:00",
            issuer_id: "ISSUER",
            retrieval_reference_no: "RRN-7",
            approval_code: "OK",
        }
        .sign(PAYER_SECRET);
        let body = seal(
            &self.ctx,
            &json!({
                "login": PAYER_LOGIN,
                "password": PAYER_PASSWORD,
                "storeID": LOCATION_NMID,
                "transactionNo": TX,
                "referenceNo": "REF-7",
                "amount": amount,
                "paymentStatus": "PAID",
                "paymentReferenceNo": "PAYREF-7",
                "paymentDate": "2024-05-01 10:00:00",
                "issuerID": "ISSUER",
                "retrievalReferenceNo": "RRN-7",
                "approvalCode": "OK",
                "signature": signature,
            }),
            PARTNER_KEY,
        )
        .await;
        let sealed = self.ticketing.payment(&body).await.unwrap();
        (sealed.rejection, open(&self.ctx, &sealed.payload, PARTNER_KEY).await)
    }

    async fn close(&self) -> (Option<Rejection>, GatewayResponse) {
        let body = seal(
            &self.ctx,
            &json!({
                "login": PAYER_LOGIN,
                "password": PAYER_PASSWORD,
                "transactionNo": TX,
            }),
            PARTNER_KEY,
        )
        .await;
        let sealed = self.ticketing.close_ticket(&body).await.unwrap();
        (sealed.rejection, open(&self.ctx, &sealed.payload, PARTNER_KEY).await)
    }
}

#[tokio::test]
async fn test_generated_ticket_is_stored() {
    let h = harness();

    let issued = h.ticketing.generate_ticket(VehicleType::Motor, None).await.unwrap();

    assert!(issued.transaction_no.ends_with("F007SK"));
    assert_eq!(issued.transaction_no.len(), 18);
    assert_eq!(issued.grace_period, 5);
    assert_eq!(issued.tariff, 0);
    assert_eq!(issued.in_time, "2024-05-01 10:00:00");
    assert_eq!(
        issued.url_ticket,
        format!("https://ebilling.example.com/ticket?p1={LOCATION_NMID}&p2={}", issued.transaction_no)
    );

    let stored = h.store.ticket(&issued.transaction_no).unwrap();
    assert_eq!(stored.vehicle_type, VehicleType::Motor);
    assert_eq!(stored.status, TicketStatus::Unpaid);
}

#[tokio::test]
async fn test_inquiry_inside_grace_is_free() {
    let h = harness();
    h.parked(3);

    let (rejection, response) = h.inquiry().await;

    assert_eq!(rejection, None);
    assert_eq!(response.message_detail, "Ticket is valid, Parking is still free.");
    assert_eq!(response.data["paymentStatus"], "FREE");
    assert_eq!(response.data["tariff"], 0);
}

#[tokio::test]
async fn test_inquiry_accrues_and_persists_tariff() {
    let h = harness();
    h.parked(12);

    let (_, response) = h.inquiry().await;

    assert_eq!(response.data["tariff"], 10000);
    assert_eq!(response.data["duration"], 12);
    assert_eq!(response.data["paymentStatus"], "UNPAID");

    let stored = h.store.ticket(TX).unwrap();
    assert_eq!(stored.tariff, 10000);
    assert_eq!(stored.version, 1);
    assert_eq!(h.store.inquiry_logs.lock().len(), 1);
}

#[tokio::test]
async fn test_inquiry_for_unknown_ticket() {
    let h = harness();

    let (rejection, response) = h.inquiry().await;

    assert_eq!(rejection, Some(Rejection::InvalidTransaction));
    assert_eq!(response.data["transactionStatus"], "INVALID");
}

#[tokio::test]
async fn test_payment_settles_ticket() {
    let h = harness();
    h.parked(12);
    h.inquiry().await;

    let (rejection, response) = h.pay("10000").await;

    assert_eq!(rejection, None);
    assert!(response.is_success());
    assert!(response.message_detail.contains("2024-05-01 10:30:00"));
    assert_eq!(response.data["paymentStatus"], "PAID");
    assert_eq!(response.data["referenceTransactionNo"].as_str().map(str::len), Some(8));

    let stored = h.store.ticket(TX).unwrap();
    assert_eq!(stored.status, TicketStatus::Paid);
    assert_eq!(stored.tariff, 0);
    assert_eq!(stored.reference_no.as_deref(), Some("PAYREF-7"));
}

#[tokio::test]
async fn test_payment_with_wrong_amount_is_refused() {
    let h = harness();
    h.parked(12);

    let (rejection, _) = h.pay("5000").await;

    assert_eq!(rejection, Some(Rejection::InvalidAmount));
    assert_eq!(h.store.ticket(TX).unwrap().status, TicketStatus::Unpaid);
}

#[tokio::test]
async fn test_paid_ticket_stays_frozen_then_accrues_again() {
    let h = harness();
    h.parked(12);
    h.pay("10000").await;

    h.clock.advance(Duration::minutes(20));
    let (_, frozen) = h.inquiry().await;
    assert_eq!(frozen.message_detail, "Ticket is valid and has been paid");

    h.clock.advance(Duration::minutes(20));
    let (_, due) = h.inquiry().await;
    let data: &Value = &due.data;
    assert_eq!(data["paymentStatus"], "UNPAID");
    assert!(data["tariff"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_close_requires_settled_ticket() {
    let h = harness();
    h.parked(12);

    let (rejection, _) = h.close().await;
    assert_eq!(rejection, Some(Rejection::CloseTicketUnpaid));

    h.pay("10000").await;
    let (rejection, response) = h.close().await;
    assert_eq!(rejection, None);
    assert_eq!(response.message_detail, "Ticket is closed successfully");
    assert_eq!(response.data["paymentStatus"], "PAID");
    assert!(h.store.ticket(TX).unwrap().closed);

    let (rejection, _) = h.close().await;
    assert_eq!(rejection, Some(Rejection::CloseTicketClosed));
}
