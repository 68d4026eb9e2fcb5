//! Reference ticketing system
//!
//! Owns tickets for the demo location: issues them, reports their tariff,
//! takes payment and closes them at the exit gate. Every read-modify-write
//! goes through [`TicketRepository::update_ticket`] and is retried when a
//! concurrent writer bumped the version first.
//!
//! [`TicketRepository::update_ticket`]: crate::repository::TicketRepository::update_ticket

use super::gateway::{PROJECT_CATEGORY_ID, PROJECT_CATEGORY_NAME};
use super::{observe, Sealed, ServiceContext};
use crate::config::TicketingConfig;
use crate::errors::{GatewayServiceError, Result};
use crate::metrics::TICKET_CONFLICTS;
use crate::models::{
    field, CloseTicketRequest, EncryptedPayload, InquiryLog, InquiryRequest, PartnerCredential,
    PaymentRequest, SignatureInquiryRequest, SignaturePaymentRequest,
};
use actix_web::http::StatusCode;
use chrono::{DateTime, Utc};
use gateway_core::clock::format_local;
use gateway_core::codec::{InquiryFields, PaymentFields, Signable};
use gateway_core::response::paid_placeholder_data;
use gateway_core::routing::has_access;
use gateway_core::tariff::{generate_reference_no, generate_transaction_no};
use gateway_core::{
    AccessType, GatewayResponse, Rejection, ShortResponse, Ticket, TicketPhase, TicketStatus, VehicleType,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use validator::Validate;

const DESCRIPTION_SUCCESS: &str = "Transaction Success";
const REFERENCE_TRANSACTION_LEN: usize = 8;
const ISSUE_ATTEMPTS: u32 = 5;

/// Newly issued ticket, as printed at the entry gate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTicket {
    pub response_status: String,
    pub response_code: String,
    pub response_description: String,
    pub message_detail: String,
    pub transaction_no: String,
    pub tariff: i64,
    pub status: String,
    pub grace_period: i64,
    pub url_ticket: String,
    #[serde(rename = "storeID")]
    pub store_id: String,
    pub location_code: String,
    pub vehicle_type: String,
    pub in_time: String,
}

/// Signature helper answer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureSample {
    pub response_code: String,
    pub response_message: String,
    pub signature: String,
    /// Request with its signature, sealed with the partner key
    pub data: String,
}

/// Outcome of one settle attempt against the stored ticket
enum Settlement {
    Missing,
    AlreadyPaid,
    StillFree(Ticket),
    AmountMismatch(i64),
    Paid(Ticket),
}

#[derive(Debug, Clone)]
pub struct TicketingService {
    ctx: ServiceContext,
    settings: TicketingConfig,
}

impl TicketingService {
    pub fn new(ctx: ServiceContext, settings: TicketingConfig) -> Self {
        Self { ctx, settings }
    }

    /// Issue a ticket with a fresh transaction number
    #[instrument(skip(self))]
    pub async fn generate_ticket(&self, vehicle_type: VehicleType, grace_period: Option<i64>) -> Result<IssuedTicket> {
        let grace = grace_period.unwrap_or(self.settings.default_grace_minutes);
        let now = self.ctx.clock.now();

        for _ in 0..ISSUE_ATTEMPTS {
            let transaction_no = generate_transaction_no(&mut rand::thread_rng());
            let ticket = Ticket::issue(&transaction_no, grace, vehicle_type, now);

            match self.ctx.store.insert_ticket(&ticket).await {
                Ok(()) => {
                    info!(transaction_no = %transaction_no, vehicle_type = %vehicle_type, "Ticket issued");
                    return Ok(self.issued(&ticket));
                }
                Err(e) if e.is_unique_violation() => {
                    warn!(transaction_no = %transaction_no, "Ticket number collision, drawing another");
                }
                Err(e) => return Err(e),
            }
        }
        Err(GatewayServiceError::Internal(
            "could not draw an unused ticket number".to_string(),
        ))
    }

    fn issued(&self, ticket: &Ticket) -> IssuedTicket {
        IssuedTicket {
            response_status: "Success".to_string(),
            response_code: gateway_core::response::CODE_SUCCESS.to_string(),
            response_description: DESCRIPTION_SUCCESS.to_string(),
            message_detail: "The ticket was generated successfully.".to_string(),
            transaction_no: ticket.transaction_no.clone(),
            tariff: ticket.tariff,
            status: ticket.status.to_string(),
            grace_period: ticket.grace_period,
            url_ticket: format!(
                "{}?p1={}&p2={}",
                self.settings.ticket_url_base, self.settings.store_id, ticket.transaction_no
            ),
            store_id: self.settings.store_id.clone(),
            location_code: self.settings.location_code.clone(),
            vehicle_type: ticket.vehicle_type.to_string(),
            in_time: format_local(ticket.in_time),
        }
    }

    #[instrument(skip_all)]
    pub async fn inquiry(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_inquiry(body).await;
        observe("post_inquiry", &result);
        result
    }

    #[instrument(skip_all)]
    pub async fn payment(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_payment(body).await;
        observe("post_payment", &result);
        result
    }

    #[instrument(skip_all)]
    pub async fn close_ticket(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_close(body).await;
        observe("post_close_ticket", &result);
        result
    }

    async fn process_inquiry(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let key = ctx.partner_key.as_str();
        let req: InquiryRequest = match ctx.open_envelope(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = field(&req.transaction_no).to_string();

        if req.validate().is_err() {
            return ctx.reject(Rejection::MissingFields, &tx, key).await;
        }
        let Some(partner) = self.authenticate(field(&req.login), field(&req.password)).await? else {
            return ctx.reject(Rejection::InvalidCredential, &tx, key).await;
        };

        let signed = InquiryFields {
            login: field(&req.login),
            password: field(&req.password),
            store_id: field(&req.store_id),
            transaction_no: &tx,
        };
        if !signed.verify(&partner.secret_key, field(&req.signature)) {
            return ctx.reject(Rejection::InvalidSignature, &tx, key).await;
        }
        if !has_access(&ctx.store.roles(partner.id).await?, AccessType::Inquiry) {
            return ctx.reject(Rejection::AccessDenied, &tx, key).await;
        }

        let now = ctx.clock.now();
        let Some(ticket) = self.accrue_and_store(&tx, now).await? else {
            return ctx.reject(Rejection::InvalidTransaction, &tx, key).await;
        };

        let response = self.describe(&ticket, now);
        let entry = InquiryLog {
            company_name: partner.company_name.clone(),
            nmid: self.settings.location_code.clone(),
            store_code: self.settings.location_code.clone(),
            transaction_no: tx.clone(),
            data_send: serde_json::to_string(&req)?,
            data_response: serde_json::to_string(&response)?,
            data_detail_response: response.data.to_string(),
            project_category_id: PROJECT_CATEGORY_ID,
            project_category_name: PROJECT_CATEGORY_NAME.to_string(),
            created_by: field(&req.login).to_string(),
        };
        if let Err(e) = ctx.store.log_inquiry(&entry).await {
            error!(transaction_no = %tx, error = %e, "Failed to write inquiry log");
        }

        ctx.seal_response(&response, key).await
    }

    /// Inquiry view of a ticket that has already been accrued
    fn describe(&self, ticket: &Ticket, now: DateTime<Utc>) -> GatewayResponse {
        match ticket.phase(now) {
            TicketPhase::PaidFrozen => GatewayResponse::success(
                DESCRIPTION_SUCCESS,
                "Ticket is valid and has been paid",
                self.ticket_data(ticket, now, "PAID"),
            ),
            TicketPhase::Closed => {
                let detail = if ticket.paid_at.is_some() {
                    "Ticket is valid and has been paid, the vehicle has left the parking location"
                } else {
                    "Ticket is valid, parking fee is free, the vehicle has left the parking location"
                };
                GatewayResponse::success(DESCRIPTION_SUCCESS, detail, self.ticket_data(ticket, now, "PAID"))
            }
            TicketPhase::Free => GatewayResponse::success(
                DESCRIPTION_SUCCESS,
                "Ticket is valid, Parking is still free.",
                self.ticket_data(ticket, now, "FREE"),
            ),
            TicketPhase::Due(tariff) => {
                let status = if tariff == 0 { "PAID" } else { "UNPAID" };
                GatewayResponse::success(
                    DESCRIPTION_SUCCESS,
                    "Ticket is valid, please continue for payment",
                    self.ticket_data(ticket, now, status),
                )
            }
        }
    }

    fn ticket_data(&self, ticket: &Ticket, now: DateTime<Utc>, payment_status: &str) -> Value {
        // Settled tickets report the stay up to exit, open ones up to now
        let duration = match ticket.out_time {
            Some(out) => (out - ticket.in_time).num_minutes().max(0),
            None if payment_status == "FREE" => 0,
            None => ticket.duration_minutes(now),
        };
        json!({
            "transactionNo": ticket.transaction_no,
            "transactionStatus": "VALID",
            "inTime": format_local(ticket.in_time),
            "duration": duration,
            "tariff": ticket.tariff,
            "vehicleType": ticket.vehicle_type.as_str(),
            "outTime": ticket.out_time.map(format_local).unwrap_or_default(),
            "gracePeriod": ticket.grace_period,
            "location": self.settings.location_name,
            "paymentStatus": payment_status,
        })
    }

    async fn process_payment(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let key = ctx.partner_key.as_str();
        let req: PaymentRequest = match ctx.open_envelope(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = field(&req.transaction_no).to_string();

        if req.validate().is_err() {
            return ctx.reject(Rejection::MissingFields, &tx, key).await;
        }
        let Some(partner) = self.authenticate(field(&req.login), field(&req.password)).await? else {
            return ctx.reject(Rejection::InvalidCredential, &tx, key).await;
        };

        if !payment_fields(&req).verify(&partner.secret_key, field(&req.signature)) {
            return ctx.reject(Rejection::InvalidSignature, &tx, key).await;
        }
        if !has_access(&ctx.store.roles(partner.id).await?, AccessType::Payment) {
            return ctx.reject(Rejection::AccessDenied, &tx, key).await;
        }

        let now = ctx.clock.now();
        let Some(settlement) = self.settle(&tx, req.amount_value(), field(&req.payment_reference_no), now).await? else {
            let body = ShortResponse::new("500200", "Failure Update Transaction");
            return ctx.seal_value(&body, &body.response_code, key, StatusCode::OK).await;
        };

        let response = match settlement {
            Settlement::Missing => return ctx.reject(Rejection::InvalidTransaction, &tx, key).await,
            Settlement::AmountMismatch(tariff) => {
                info!(transaction_no = %tx, tariff, amount = field(&req.amount), "Payment amount does not match tariff");
                return ctx.reject(Rejection::InvalidAmount, &tx, key).await;
            }
            Settlement::AlreadyPaid => GatewayResponse::success(
                DESCRIPTION_SUCCESS,
                "Ticket is valid and has been paid",
                paid_placeholder_data(&tx),
            ),
            Settlement::StillFree(ticket) => GatewayResponse::success(
                DESCRIPTION_SUCCESS,
                "Ticket is valid, Parking is still free.",
                self.ticket_data(&ticket, now, "FREE"),
            ),
            Settlement::Paid(ticket) => {
                let deadline = ticket.exit_deadline().unwrap_or(now);
                let reference_transaction_no =
                    generate_reference_no(&mut rand::thread_rng(), REFERENCE_TRANSACTION_LEN);
                info!(transaction_no = %tx, partner = %partner.company_name, "Ticket paid");
                GatewayResponse::success(
                    DESCRIPTION_SUCCESS,
                    format!(
                        "Ticket paid successfully. To avoid additional costs, please make sure you exit before {} Not valid for flat rates.",
                        format_local(deadline)
                    ),
                    json!({
                        "referenceNo": field(&req.reference_no),
                        "referenceTransactionNo": reference_transaction_no,
                        "amount": field(&req.amount),
                        "paymentReferenceNo": field(&req.payment_reference_no),
                        "paymentDate": format_local(now),
                        "issuerID": field(&req.issuer_id),
                        "retrievalReferenceNo": field(&req.retrieval_reference_no),
                        "transactionNo": tx,
                        "transactionStatus": "VALID",
                        "paymentStatus": TicketStatus::Paid.as_str(),
                    }),
                )
            }
        };
        ctx.seal_response(&response, key).await
    }

    /// Apply a payment under the version check; `None` when every attempt lost the race
    async fn settle(
        &self,
        transaction_no: &str,
        amount: Option<i64>,
        payment_reference_no: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Settlement>> {
        for attempt in 1..=self.settings.max_update_attempts.max(1) {
            let Some(mut ticket) = self.ctx.store.find_ticket(transaction_no).await? else {
                return Ok(Some(Settlement::Missing));
            };
            ticket.accrue(now);

            if ticket.tariff == 0 {
                return Ok(Some(match ticket.status {
                    TicketStatus::Paid => Settlement::AlreadyPaid,
                    TicketStatus::Unpaid => Settlement::StillFree(ticket),
                }));
            }
            if amount != Some(ticket.tariff) {
                return Ok(Some(Settlement::AmountMismatch(ticket.tariff)));
            }

            ticket.mark_paid(now, payment_reference_no);
            if self.ctx.store.update_ticket(&ticket).await? {
                ticket.version += 1;
                return Ok(Some(Settlement::Paid(ticket)));
            }
            TICKET_CONFLICTS.with_label_values(&["payment"]).inc();
            warn!(transaction_no, attempt, "Ticket changed during payment, retrying");
        }
        Ok(None)
    }

    async fn process_close(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let key = ctx.partner_key.as_str();
        let req: CloseTicketRequest = match ctx.open_envelope(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = field(&req.transaction_no).to_string();

        if req.validate().is_err() {
            return ctx.reject(Rejection::MissingFields, &tx, key).await;
        }
        if self.authenticate(field(&req.login), field(&req.password)).await?.is_none() {
            return ctx.reject(Rejection::InvalidCredential, &tx, key).await;
        }

        let now = ctx.clock.now();
        for attempt in 1..=self.settings.max_update_attempts.max(1) {
            let Some(mut ticket) = ctx.store.find_ticket(&tx).await? else {
                return ctx.reject(Rejection::InvalidTransaction, &tx, key).await;
            };
            ticket.accrue(now);

            if let Err(e) = ticket.close() {
                let rejection = match e {
                    gateway_core::Error::OutstandingBalance { .. } => Rejection::CloseTicketUnpaid,
                    _ => Rejection::CloseTicketClosed,
                };
                return ctx.reject(rejection, &tx, key).await;
            }

            if ctx.store.update_ticket(&ticket).await? {
                info!(transaction_no = %tx, "Ticket closed");
                let response = GatewayResponse::success(
                    DESCRIPTION_SUCCESS,
                    "Ticket is closed successfully",
                    self.closed_data(&ticket),
                );
                return ctx.seal_response(&response, key).await;
            }
            TICKET_CONFLICTS.with_label_values(&["close"]).inc();
            warn!(transaction_no = %tx, attempt, "Ticket changed during close, retrying");
        }

        let body = ShortResponse::new("500200", "System Failure Update Transaction");
        ctx.seal_value(&body, &body.response_code, key, StatusCode::OK).await
    }

    fn closed_data(&self, ticket: &Ticket) -> Value {
        let duration = ticket
            .out_time
            .map(|out| (out - ticket.in_time).num_minutes().max(0))
            .unwrap_or_default();
        let paid = ticket.status == TicketStatus::Paid;
        json!({
            "transactionNo": ticket.transaction_no,
            "locationCode": self.settings.location_code,
            "vehicleType": ticket.vehicle_type.as_str(),
            "inTime": format_local(ticket.in_time),
            "duration": duration,
            "tariff": ticket.tariff,
            "gracePeriod": ticket.grace_period,
            "paymentStatus": if paid { "PAID" } else { "FREE" },
            "paymentReferenceNo": ticket.reference_no.clone().unwrap_or_default(),
            "paymentDate": ticket.paid_at.map(format_local).unwrap_or_default(),
            "paymentMethod": "IN-APP",
            "outTime": ticket.out_time.map(format_local).unwrap_or_default(),
        })
    }

    /// Load, accrue and persist; `None` for an unknown ticket
    async fn accrue_and_store(&self, transaction_no: &str, now: DateTime<Utc>) -> Result<Option<Ticket>> {
        for attempt in 1..=self.settings.max_update_attempts.max(1) {
            let Some(mut ticket) = self.ctx.store.find_ticket(transaction_no).await? else {
                return Ok(None);
            };
            if !ticket.accrue(now) {
                return Ok(Some(ticket));
            }
            if self.ctx.store.update_ticket(&ticket).await? {
                ticket.version += 1;
                return Ok(Some(ticket));
            }
            TICKET_CONFLICTS.with_label_values(&["accrue"]).inc();
            warn!(transaction_no, attempt, "Ticket changed during accrual, retrying");
        }
        Err(GatewayServiceError::Conflict(transaction_no.to_string()))
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<Option<PartnerCredential>> {
        self.ctx.store.find_by_credentials(login, password).await
    }

    /// Sign an inquiry for a partner and seal it, for integration testing
    pub async fn sign_inquiry(&self, req: &SignatureInquiryRequest) -> Result<Option<SignatureSample>> {
        let Some(partner) = self.authenticate(&req.login, &req.password).await? else {
            return Ok(None);
        };
        let signature = InquiryFields {
            login: &req.login,
            password: &req.password,
            store_id: &req.store_id,
            transaction_no: &req.transaction_no,
        }
        .sign(&partner.secret_key);

        let payload = json!({
            "login": req.login,
            "password": req.password,
            "storeID": req.store_id,
            "transactionNo": req.transaction_no,
            "signature": signature,
        });
        self.sample(signature, &payload).await.map(Some)
    }

    pub async fn sign_payment(&self, req: &SignaturePaymentRequest) -> Result<Option<SignatureSample>> {
        let Some(partner) = self.authenticate(&req.login, &req.password).await? else {
            return Ok(None);
        };
        let signature = PaymentFields {
            login: &req.login,
            password: &req.password,
            store_id: &req.store_id,
            transaction_no: &req.transaction_no,
            reference_no: &req.reference_no,
            amount: &req.amount,
            payment_status: &req.payment_status,
            payment_reference_no: &req.payment_reference_no,
            payment_date: &req.payment_date,
            issuer_id: &req.issuer_id,
            retrieval_reference_no: &req.retrieval_reference_no,
            approval_code: &req.approval_code,
        }
        .sign(&partner.secret_key);

        let payload = json!({
            "login": req.login,
            "password": req.password,
            "storeID": req.store_id,
            "transactionNo": req.transaction_no,
            "referenceNo": req.reference_no,
            "amount": req.amount,
            "paymentStatus": req.payment_status,
            "paymentReferenceNo": req.payment_reference_no,
            "paymentDate": req.payment_date,
            "issuerID": req.issuer_id,
            "retrievalReferenceNo": req.retrieval_reference_no,
            "approvalCode": req.approval_code,
            "signature": signature,
        });
        self.sample(signature, &payload).await.map(Some)
    }

    async fn sample(&self, signature: String, payload: &Value) -> Result<SignatureSample> {
        let data = self.ctx.crypto.seal_json(payload, &self.ctx.partner_key).await?;
        Ok(SignatureSample {
            response_code: "200200".to_string(),
            response_message: "Success".to_string(),
            signature,
            data,
        })
    }
}

fn payment_fields(req: &PaymentRequest) -> PaymentFields<'_> {
    PaymentFields {
        login: field(&req.login),
        password: field(&req.password),
        store_id: field(&req.store_id),
        transaction_no: field(&req.transaction_no),
        reference_no: field(&req.reference_no),
        amount: field(&req.amount),
        payment_status: field(&req.payment_status),
        payment_reference_no: field(&req.payment_reference_no),
        payment_date: field(&req.payment_date),
        issuer_id: field(&req.issuer_id),
        retrieval_reference_no: field(&req.retrieval_reference_no),
        approval_code: field(&req.approval_code),
    }
}
