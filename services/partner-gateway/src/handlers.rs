use crate::errors::Result;
use crate::lock::LockManager;
use crate::metrics;
use crate::middleware::ClientAuth;
use crate::models::{
    EncryptedPayload, GenerateTicketRequest, HealthReport, NearbyLocationRequest, SignatureInquiryRequest,
    SignaturePaymentRequest, VoucherRedemptionRequest, VoucherUsageRequest,
};
use crate::queue::{Enqueued, Job, JobQueue};
use crate::repository::Store;
use crate::services::location::{LocationResponse, CODE_LOCATION_NOT_FOUND};
use crate::services::{
    AutoEntryService, GatewayService, LocationService, Sealed, TicketingService, VoucherService,
};
use crate::worker::redeem_exclusive;
use actix_web::{http::StatusCode, web, HttpResponse};
use gateway_core::clock::format_local;
use gateway_core::{Clock, ShortResponse, VehicleType};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};
use validator::Validate;

/// Everything the handlers reach for
#[derive(Clone)]
pub struct AppState {
    pub gateway: GatewayService,
    pub ticketing: TicketingService,
    pub vouchers: VoucherService,
    pub auto_entry: AutoEntryService,
    pub locations: LocationService,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<dyn LockManager>,
    pub queue: Arc<dyn JobQueue>,
    pub lock_ttl: Duration,
    /// Health reports WARNING above this database round-trip
    pub slow_threshold: Duration,
}

/// Lenient envelope parse; anything unreadable becomes an empty envelope
fn envelope(body: &[u8]) -> EncryptedPayload {
    serde_json::from_slice(body).unwrap_or_default()
}

fn sealed(answer: Sealed) -> HttpResponse {
    HttpResponse::build(answer.status).json(answer.payload)
}

/// Names from `required` that are absent, null or blank in `body`
fn missing_fields<'a>(body: &Value, required: &[&'a str]) -> Vec<&'a str> {
    required
        .iter()
        .copied()
        .filter(|name| match body.get(*name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .collect()
}

fn parse_checked<T: DeserializeOwned>(body: &[u8], required: &[&str]) -> std::result::Result<T, HttpResponse> {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let missing = missing_fields(&value, required);
    if !missing.is_empty() {
        return Err(HttpResponse::BadRequest().json(ShortResponse::new(
            "400400",
            &format!("Missing fields: {}", missing.join(", ")),
        )));
    }
    serde_json::from_value(value)
        .map_err(|_| HttpResponse::BadRequest().json(ShortResponse::new("400400", "Invalid request body")))
}

fn invalid_credential() -> HttpResponse {
    HttpResponse::Unauthorized().json(ShortResponse::new("401402", "Invalid Credential"))
}

// ===== Partner gateway =====

pub async fn partner_inquiry(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("inquiry");
    Ok(sealed(state.gateway.inquiry(&envelope(&body)).await?))
}

pub async fn partner_payment(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("payment_confirmation");
    Ok(sealed(state.gateway.payment_confirmation(&envelope(&body)).await?))
}

// ===== Ticketing =====

pub async fn post_inquiry(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("post_inquiry");
    Ok(sealed(state.ticketing.inquiry(&envelope(&body)).await?))
}

pub async fn post_payment(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("post_payment");
    Ok(sealed(state.ticketing.payment(&envelope(&body)).await?))
}

pub async fn close_ticket(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("close_ticket");
    Ok(sealed(state.ticketing.close_ticket(&envelope(&body)).await?))
}

pub async fn generate_ticket(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let req: GenerateTicketRequest = if body.iter().all(u8::is_ascii_whitespace) {
        GenerateTicketRequest {
            vehicle_type: None,
            grace_period: None,
        }
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(_) => {
                return Ok(HttpResponse::BadRequest().json(json!({"success": false, "error": "Invalid request body"})));
            }
        }
    };
    if req.validate().is_err() {
        return Ok(HttpResponse::BadRequest().json(json!({"success": false, "error": "Invalid vehicle type or grace period"})));
    }

    let vehicle_type = req
        .vehicle_type
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(VehicleType::Mobil);
    let ticket = state.ticketing.generate_ticket(vehicle_type, req.grace_period).await?;
    Ok(HttpResponse::Ok().json(json!({"success": true, "data": ticket})))
}

pub async fn signature_inquiry(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let req: SignatureInquiryRequest =
        match parse_checked(&body, &["login", "password", "storeID", "transactionNo"]) {
            Ok(req) => req,
            Err(response) => return Ok(response),
        };
    match state.ticketing.sign_inquiry(&req).await? {
        Some(sample) => Ok(HttpResponse::Ok().json(sample)),
        None => Ok(invalid_credential()),
    }
}

pub async fn signature_payment(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    const REQUIRED: [&str; 12] = [
        "login",
        "password",
        "storeID",
        "transactionNo",
        "referenceNo",
        "amount",
        "paymentStatus",
        "paymentReferenceNo",
        "paymentDate",
        "issuerID",
        "retrievalReferenceNo",
        "approvalCode",
    ];
    let req: SignaturePaymentRequest = match parse_checked(&body, &REQUIRED) {
        Ok(req) => req,
        Err(response) => return Ok(response),
    };
    match state.ticketing.sign_payment(&req).await? {
        Some(sample) => Ok(HttpResponse::Ok().json(sample)),
        None => Ok(invalid_credential()),
    }
}

pub async fn auto_entry(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("auto_entry");
    Ok(sealed(state.auto_entry.check(&envelope(&body)).await?))
}

// ===== Vouchers =====

pub async fn voucher_redemption(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("voucher_redemption");
    let payload = envelope(&body);
    let answer = match state.vouchers.peek_transaction_no(&payload).await {
        Some(tx) => redeem_exclusive(state.locks.as_ref(), &state.vouchers, &payload, &tx, state.lock_ttl).await?,
        // Unreadable requests are rejected without taking a lock
        None => state.vouchers.redeem(&payload).await?,
    };
    Ok(sealed(answer))
}

fn queued(outcome: Enqueued) -> HttpResponse {
    match outcome {
        Enqueued::Added(job_id) => HttpResponse::Accepted().json(json!({"status": "QUEUED", "jobId": job_id})),
        Enqueued::Existing(record) => HttpResponse::Accepted().json(json!({
            "status": record.status,
            "jobId": record.job_id,
        })),
    }
}

pub async fn queue_redemption(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let payload = envelope(&body);
    let Some(tx) = state.vouchers.peek_transaction_no(&payload).await else {
        return Ok(sealed(state.vouchers.redeem(&payload).await?));
    };
    Ok(queued(state.queue.enqueue(Job::redemption(&tx, payload)).await?))
}

pub async fn voucher_inquiry(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("voucher_inquiry");
    Ok(sealed(state.vouchers.inquiry(&envelope(&body)).await?))
}

pub async fn queue_inquiry(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    Ok(queued(state.queue.enqueue(Job::inquiry(envelope(&body))).await?))
}

pub async fn job_status(state: web::Data<AppState>, job_id: web::Path<String>) -> Result<HttpResponse> {
    match state.queue.record(&job_id).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Ok(HttpResponse::NotFound().json(ShortResponse::new("404404", "Job Not Found"))),
    }
}

pub async fn usage_notification(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let _timer = metrics::request_timer("usage_notification");
    Ok(sealed(state.vouchers.usage_notification(&envelope(&body)).await?))
}

pub async fn generate_redemption(
    state: web::Data<AppState>,
    req: web::Json<VoucherRedemptionRequest>,
) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.vouchers.generate_redemption(&req).await?))
}

pub async fn generate_usage(state: web::Data<AppState>, req: web::Json<VoucherUsageRequest>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.vouchers.generate_usage(&req).await?))
}

// ===== Locations (header auth) =====

pub async fn location_detail(state: web::Data<AppState>, code: web::Path<String>) -> Result<HttpResponse> {
    match state.locations.location_detail(&code).await? {
        Some(detail) => Ok(HttpResponse::Ok().json(LocationResponse::found(detail))),
        None => Ok(HttpResponse::NotFound().json(LocationResponse::<()>::failed(
            CODE_LOCATION_NOT_FOUND,
            "Location Not Found",
        ))),
    }
}

pub async fn nearby_locations(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let req: Option<NearbyLocationRequest> = serde_json::from_slice(&body).ok();
    let Some(req) = req.filter(|r| r.validate().is_ok()) else {
        return Ok(HttpResponse::BadRequest().json(LocationResponse::<()>::failed(
            "400400",
            "Invalid latitude, longitude, or radius values",
        )));
    };
    let nearby = state.locations.nearby(&req).await?;
    Ok(HttpResponse::Ok().json(LocationResponse::found(nearby)))
}

// ===== Operations =====

/// Database round-trip check
pub async fn connection_health(state: web::Data<AppState>) -> HttpResponse {
    let started = Instant::now();
    let probe = state.store.ping().await;
    let elapsed = started.elapsed();

    let (code, status, message) = match probe {
        Ok(()) if elapsed > state.slow_threshold => {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "Slow database round-trip");
            (StatusCode::OK, "WARNING", "Database connection is slow")
        }
        Ok(()) => (StatusCode::OK, "OK", "Database connection is healthy"),
        Err(e) => {
            error!(error = %e, "Database health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "ERROR", "Database connection failed")
        }
    };

    HttpResponse::build(code).json(HealthReport {
        status: status.to_string(),
        time: format_local(state.clock.now()),
        message: message.to_string(),
        response_time_ms: elapsed.as_millis(),
    })
}

pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, auth: ClientAuth) {
    cfg.service(
        web::scope("/parking")
            .route("/Partner/InquiryTariffREG", web::post().to(partner_inquiry))
            .route("/Partner/PaymentConfirmationREG", web::post().to(partner_payment))
            .route("/POST/InquiryTariffREG", web::post().to(post_inquiry))
            .route("/POST/PaymentConfirmationREG", web::post().to(post_payment))
            .route("/POST/CloseTicket", web::post().to(close_ticket))
            .route("/GenerateTicket", web::post().to(generate_ticket))
            .route("/AutoEntry", web::post().to(auto_entry))
            .route("/Signature-Inquiry", web::post().to(signature_inquiry))
            .route("/Signature-Payment", web::post().to(signature_payment)),
    )
    .service(
        web::scope("/vouchers")
            .route("/redemption", web::post().to(voucher_redemption))
            .route("/queue/redemption", web::post().to(queue_redemption))
            .route("/inquiry", web::post().to(voucher_inquiry))
            .route("/queue/inquiry", web::post().to(queue_inquiry))
            .route("/jobs/{job_id}", web::get().to(job_status))
            .route("/usage-notification", web::post().to(usage_notification))
            .route("/generate-redemption", web::post().to(generate_redemption))
            .route("/generate-usage", web::post().to(generate_usage)),
    )
    .service(
        web::scope("/realtime")
            .wrap(auth.clone())
            .route("/location/{location_code}", web::get().to(location_detail)),
    )
    .service(
        web::scope("/partner")
            .wrap(auth)
            .route("/nearby-location", web::post().to(nearby_locations)),
    )
    .route("/connection/health", web::get().to(connection_health))
    .route("/metrics", web::get().to(metrics_endpoint));
}
