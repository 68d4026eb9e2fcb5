//! Partner-facing inquiry and payment forwarding
//!
//! A payment partner talks to the gateway with the shared partner key; the
//! gateway re-signs every request with the target location's own credentials,
//! seals it with the location key and relays the answer back under the
//! partner's key.

use super::{observe, Sealed, ServiceContext, Step};
use crate::errors::Result;
use crate::models::{
    field, DownstreamResponse, EncryptedPayload, InquiryLog, InquiryRequest, PartnerCredential,
    PaymentConfirmationLog, PaymentRequest,
};
use crate::partner_client::PartnerClient;
use chrono::Duration;
use gateway_core::clock::format_local;
use gateway_core::codec::{InquiryFields, PaymentFields, PostPaymentFields, Signable};
use gateway_core::response::{paid_placeholder_data, placeholder_data, CODE_FAILED, STATUS_FAILED};
use gateway_core::routing::has_access;
use gateway_core::tariff::PAID_FREEZE_MINUTES;
use gateway_core::{AccessType, GatewayResponse, Rejection, RoleKey};
use serde_json::{json, Value};
use tracing::{error, info, instrument};
use validator::Validate;

pub const PROJECT_CATEGORY_ID: i32 = 14;
pub const PROJECT_CATEGORY_NAME: &str = "Parking";

/// Store code is the last five characters of a ticket number
pub fn store_code_of(transaction_no: &str) -> String {
    let len = transaction_no.chars().count();
    transaction_no.chars().skip(len.saturating_sub(5)).collect()
}

#[derive(Debug, Clone)]
pub struct GatewayService {
    ctx: ServiceContext,
    client: PartnerClient,
}

/// Request as forwarded and the decrypted answer
struct Forwarded {
    request: Value,
    response: DownstreamResponse,
}

impl GatewayService {
    pub fn new(ctx: ServiceContext, client: PartnerClient) -> Self {
        Self { ctx, client }
    }

    #[instrument(skip_all)]
    pub async fn inquiry(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_inquiry(body).await;
        observe("partner_inquiry", &result);
        result
    }

    #[instrument(skip_all)]
    pub async fn payment_confirmation(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_payment(body).await;
        observe("partner_payment", &result);
        result
    }

    async fn process_inquiry(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let req: InquiryRequest = match ctx.open_envelope(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = field(&req.transaction_no).to_string();

        if req.validate().is_err() {
            return ctx.reject(Rejection::MissingFields, &tx, &ctx.partner_key).await;
        }

        let partner = match ctx
            .store
            .find_by_credentials(field(&req.login), field(&req.password))
            .await?
        {
            Some(p) => p,
            None => return ctx.reject(Rejection::InvalidCredential, &tx, &ctx.partner_key).await,
        };
        let reply_key = partner.gibberish_key.clone();

        let signed = InquiryFields {
            login: field(&req.login),
            password: field(&req.password),
            store_id: field(&req.store_id),
            transaction_no: &tx,
        };
        if !signed.verify(&partner.secret_key, field(&req.signature)) {
            return ctx.reject(Rejection::InvalidSignature, &tx, &reply_key).await;
        }

        let roles = ctx.store.roles(partner.id).await?;
        if !has_access(&roles, AccessType::Inquiry) {
            return ctx.reject(Rejection::AccessDenied, &tx, &reply_key).await;
        }

        let location = match ctx.store.find_by_nmid(field(&req.store_id)).await? {
            Some(l) => l,
            None => return ctx.reject(Rejection::InvalidLocation, &tx, &reply_key).await,
        };
        let Some(url) = ctx.route(&location, RoleKey::PostInquiry).await? else {
            return ctx.reject(Rejection::AccessDenied, &tx, &reply_key).await;
        };

        let forwarded = match self.forward_inquiry(&location, &url, &tx, &reply_key).await? {
            Ok(f) => f,
            Err(sealed) => return Ok(sealed),
        };

        let entry = InquiryLog {
            company_name: location.company_name.clone(),
            nmid: location.nmid.clone(),
            store_code: store_code_of(&tx),
            transaction_no: tx.clone(),
            data_send: forwarded.request.to_string(),
            data_response: serde_json::to_string(&forwarded.response)?,
            data_detail_response: forwarded.response.data.to_string(),
            project_category_id: PROJECT_CATEGORY_ID,
            project_category_name: PROJECT_CATEGORY_NAME.to_string(),
            created_by: location.company_name.clone(),
        };
        if let Err(e) = ctx.store.log_inquiry(&entry).await {
            error!(transaction_no = %tx, error = %e, "Failed to write inquiry log");
        }

        let response = relay(&forwarded.response, &tx, None);
        info!(
            transaction_no = %tx,
            partner = %partner.company_name,
            location = %location.company_name,
            response_code = %response.response_code,
            "Inquiry relayed"
        );
        ctx.seal_response(&response, &reply_key).await
    }

    async fn process_payment(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let req: PaymentRequest = match ctx.open_envelope(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = field(&req.transaction_no).to_string();

        if req.validate().is_err() {
            return ctx.reject(Rejection::MissingFields, &tx, &ctx.partner_key).await;
        }

        let partner = match ctx
            .store
            .find_by_credentials(field(&req.login), field(&req.password))
            .await?
        {
            Some(p) => p,
            None => return ctx.reject(Rejection::InvalidCredential, &tx, &ctx.partner_key).await,
        };
        let reply_key = partner.gibberish_key.clone();

        let signed = PaymentFields {
            login: field(&req.login),
            password: field(&req.password),
            store_id: field(&req.store_id),
            transaction_no: &tx,
            reference_no: field(&req.reference_no),
            amount: field(&req.amount),
            payment_status: field(&req.payment_status),
            payment_reference_no: field(&req.payment_reference_no),
            payment_date: field(&req.payment_date),
            issuer_id: field(&req.issuer_id),
            retrieval_reference_no: field(&req.retrieval_reference_no),
            approval_code: field(&req.approval_code),
        };
        if !signed.verify(&partner.secret_key, field(&req.signature)) {
            return ctx.reject(Rejection::InvalidSignature, &tx, &reply_key).await;
        }

        let roles = ctx.store.roles(partner.id).await?;
        if !has_access(&roles, AccessType::Payment) {
            return ctx.reject(Rejection::AccessDenied, &tx, &reply_key).await;
        }

        let location = match ctx.store.find_by_nmid(field(&req.store_id)).await? {
            Some(l) => l,
            None => return ctx.reject(Rejection::InvalidLocation, &tx, &reply_key).await,
        };

        // Fresh inquiry: the bill may have changed since the partner asked
        let Some(inquiry_url) = ctx.route(&location, RoleKey::PostInquiry).await? else {
            return ctx.reject(Rejection::AccessDenied, &tx, &reply_key).await;
        };
        let recheck = match self.forward_inquiry(&location, &inquiry_url, &tx, &reply_key).await? {
            Ok(f) => f.response,
            Err(sealed) => return Ok(sealed),
        };
        if recheck.is_failed() {
            return ctx.reject(Rejection::InvalidTransaction, &tx, &reply_key).await;
        }

        let tariff = recheck.data_i64("tariff");
        let already_paid = recheck
            .data_str("paymentStatus")
            .map(|s| s.eq_ignore_ascii_case("PAID"))
            .unwrap_or(false);
        if already_paid && tariff == Some(0) {
            return ctx
                .reject_with(Rejection::BillAlreadyPaid, paid_placeholder_data(&tx), &reply_key)
                .await;
        }
        if tariff.is_none() || tariff != req.amount_value() {
            info!(transaction_no = %tx, ?tariff, amount = field(&req.amount), "Payment amount does not match tariff");
            return ctx.reject(Rejection::InvalidAmount, &tx, &reply_key).await;
        }

        let Some(payment_url) = ctx.route(&location, RoleKey::PostPayment).await? else {
            return ctx.reject(Rejection::AccessDenied, &tx, &reply_key).await;
        };

        let post_signature = PostPaymentFields {
            login: &location.login,
            password: &location.password,
            transaction_no: &tx,
            reference_no: field(&req.reference_no),
            amount: field(&req.amount),
            payment_status: field(&req.payment_status),
            payment_reference_no: field(&req.payment_reference_no),
            payment_date: field(&req.payment_date),
            issuer_id: field(&req.issuer_id),
            retrieval_reference_no: field(&req.retrieval_reference_no),
        }
        .sign(&location.secret_key);

        let post_request = json!({
            "login": location.login,
            "password": location.password,
            "transactionNo": tx,
            "referenceNo": field(&req.reference_no),
            "amount": field(&req.amount),
            "paymentStatus": field(&req.payment_status),
            "paymentReferenceNo": field(&req.payment_reference_no),
            "paymentDate": field(&req.payment_date),
            "issuerID": field(&req.issuer_id),
            "retrievalReferenceNo": field(&req.retrieval_reference_no),
            "signature": post_signature,
        });

        let confirmed = match self
            .forward(&location, &payment_url, post_request, &tx, &reply_key)
            .await?
        {
            Ok(f) => f,
            Err(sealed) => return Ok(sealed),
        };

        let exit_before = ctx.clock.now() + Duration::minutes(PAID_FREEZE_MINUTES);
        let detail = format!(
            "Ticket paid successfully. To avoid additional costs, please make sure you exit before {} Not valid for flat rates.",
            format_local(exit_before)
        );
        let response = relay(&confirmed.response, &tx, Some(detail));

        let entry = PaymentConfirmationLog {
            company_name: location.company_name.clone(),
            nmid: location.nmid.clone(),
            store_code: store_code_of(&tx),
            transaction_no: tx.clone(),
            reference_no: field(&req.reference_no).to_string(),
            amount: field(&req.amount).to_string(),
            payment_status: field(&req.payment_status).to_string(),
            merchant_data_request: serde_json::to_string(&req)?,
            merchant_data_response: serde_json::to_string(&response)?,
            post_data_request: confirmed.request.to_string(),
            post_data_response: serde_json::to_string(&confirmed.response)?,
            created_by: location.login.clone(),
        };
        if let Err(e) = ctx.store.log_payment(&entry).await {
            error!(transaction_no = %tx, error = %e, "Failed to write payment confirmation log");
        }

        info!(
            transaction_no = %tx,
            partner = %partner.company_name,
            response_code = %response.response_code,
            "Payment confirmation relayed"
        );
        ctx.seal_response(&response, &reply_key).await
    }

    async fn forward_inquiry(
        &self,
        location: &PartnerCredential,
        url: &str,
        transaction_no: &str,
        reply_key: &str,
    ) -> Result<Step<Forwarded>> {
        let signature = InquiryFields {
            login: &location.login,
            password: &location.password,
            store_id: &location.nmid,
            transaction_no,
        }
        .sign(&location.secret_key);

        let request = json!({
            "login": location.login,
            "password": location.password,
            "storeID": location.nmid,
            "transactionNo": transaction_no,
            "signature": signature,
        });
        self.forward(location, url, request, transaction_no, reply_key)
            .await
    }

    /// Seal with the location key, call, open the answer with the same key
    async fn forward(
        &self,
        location: &PartnerCredential,
        url: &str,
        request: Value,
        transaction_no: &str,
        reply_key: &str,
    ) -> Result<Step<Forwarded>> {
        let ctx = &self.ctx;
        let sealed = ctx.crypto.seal_json(&request, &location.gibberish_key).await?;

        let reply = match self.client.post_envelope(url, &sealed).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(transaction_no, url, error = %e, "Location unreachable");
                return Ok(Err(ctx
                    .reject(Rejection::DownstreamUnavailable, transaction_no, reply_key)
                    .await?));
            }
        };

        let opened = match reply.ciphertext() {
            Some(cipher) => {
                ctx.crypto
                    .open_json::<DownstreamResponse>(cipher, &location.gibberish_key)
                    .await
            }
            None => None,
        };
        match opened {
            Some(response) => Ok(Ok(Forwarded { request, response })),
            None => {
                error!(transaction_no, url, "Location answered with an unreadable envelope");
                Ok(Err(ctx.general_error(reply_key).await?))
            }
        }
    }
}

/// Partner view of a location answer
fn relay(downstream: &DownstreamResponse, transaction_no: &str, success_detail: Option<String>) -> GatewayResponse {
    let data = if downstream.data.is_null() {
        placeholder_data(transaction_no)
    } else {
        downstream.data.clone()
    };
    let description = downstream.response_description.clone().unwrap_or_default();

    if downstream.is_failed() {
        let detail = match success_detail {
            Some(_) => "INVALID TRANSACTION".to_string(),
            None => downstream.message_detail.clone().unwrap_or_default(),
        };
        GatewayResponse {
            response_status: STATUS_FAILED.to_string(),
            response_code: CODE_FAILED.to_string(),
            response_description: description,
            message_detail: detail,
            data,
        }
    } else {
        let detail = success_detail.unwrap_or_else(|| downstream.message_detail.clone().unwrap_or_default());
        let mut response = GatewayResponse::success(&description, detail, data);
        if let Some(status) = &downstream.response_status {
            response.response_status = status.clone();
        }
        response
    }
}
