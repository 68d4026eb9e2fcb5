//! Voucher redemption and usage
//!
//! Merchants redeem parking vouchers against a ticket; the gateway asks the
//! location's ticketing system to apply the voucher and keeps one ledger row
//! per redemption. When the vehicle leaves, the ticketing system notifies the
//! gateway, which relays the usage to the merchant.
//!
//! Every answer is `{ "data": "<ciphertext>" }` sealed with the shared partner
//! key. Failures use HTTP 400 and carry the string `"Invalid Transaction"` as
//! their data.

use super::{observe, Sealed, ServiceContext, Step};
use crate::errors::Result;
use crate::models::{
    DownstreamResponse, EncryptedPayload, NewVoucherRedemption, NewVoucherUsage, PartnerCredential,
    RedemptionStatus, VoucherInquiryRequest, VoucherRedemptionRequest, VoucherUsageRequest,
};
use crate::partner_client::PartnerClient;
use crate::repository::RedemptionInsert;
use actix_web::http::StatusCode;
use gateway_core::codec::{RedemptionFields, Signable, UsageFields, VoucherInquiryFields};
use gateway_core::response::CODE_SUCCESS;
use gateway_core::{GatewayResponse, Rejection, RoleKey};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use validator::Validate;

const SAVED: &str = "Transaction is valid and saved successfully";

#[derive(Debug, Clone)]
pub struct VoucherService {
    ctx: ServiceContext,
    client: PartnerClient,
}

impl VoucherService {
    pub fn new(ctx: ServiceContext, client: PartnerClient) -> Self {
        Self { ctx, client }
    }

    /// Transaction number inside a redemption envelope, for job ids
    pub async fn peek_transaction_no(&self, body: &EncryptedPayload) -> Option<String> {
        let cipher = body.ciphertext()?;
        let req: VoucherRedemptionRequest = self.ctx.crypto.open_json(cipher, &self.ctx.partner_key).await?;
        Some(req.transaction_no.trim().to_string()).filter(|tx| !tx.is_empty())
    }

    #[instrument(skip_all)]
    pub async fn redeem(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_redemption(body).await;
        observe("voucher_redemption", &result);
        result
    }

    #[instrument(skip_all)]
    pub async fn usage_notification(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_usage(body).await;
        observe("voucher_usage", &result);
        result
    }

    #[instrument(skip_all)]
    pub async fn inquiry(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process_inquiry(body).await;
        observe("voucher_inquiry", &result);
        result
    }

    /// Encrypted failure answer shared by every voucher endpoint
    async fn fail(&self, rejection: Rejection) -> Result<Sealed> {
        let mut sealed = self
            .ctx
            .seal_value(
                &rejection.respond(json!("Invalid Transaction")),
                rejection.code(),
                &self.ctx.partner_key,
                StatusCode::BAD_REQUEST,
            )
            .await?;
        sealed.rejection = Some(rejection);
        Ok(sealed)
    }

    async fn open<T: serde::de::DeserializeOwned + Validate>(&self, body: &EncryptedPayload) -> Result<Step<T>> {
        let opened = match body.ciphertext() {
            Some(cipher) => self.ctx.crypto.open_json::<T>(cipher, &self.ctx.partner_key).await,
            None => None,
        };
        match opened {
            Some(req) if req.validate().is_ok() => Ok(Ok(req)),
            Some(_) => Ok(Err(self.fail(Rejection::ValidationError).await?)),
            None => Ok(Err(self.fail(Rejection::InvalidEnvelope).await?)),
        }
    }

    async fn process_redemption(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let req: VoucherRedemptionRequest = match self.open(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = req.transaction_no.as_str();
        let Some(expiry) = req.expiry_date() else {
            return self.fail(Rejection::ValidationError).await;
        };

        let Some(location) = ctx.store.find_by_store_code(&req.location_code).await? else {
            return self.fail(Rejection::InvalidLocation).await;
        };

        if let Some(existing) = ctx
            .store
            .find_redemption_by_refs(&req.transaction_reference_no, &req.transaction_receipt_no)
            .await?
        {
            info!(
                transaction_no = tx,
                existing_id = existing.id,
                existing_transaction_no = %existing.transaction_no,
                "Voucher already redeemed"
            );
            return self.fail(Rejection::DuplicateVoucher).await;
        }

        let Some(url) = ctx.route(&location, RoleKey::PostRedemption).await? else {
            return self.fail(Rejection::AccessDenied).await;
        };

        let signature = RedemptionFields {
            login: &location.login,
            password: &location.password,
            merchant_id: &req.merchant_id,
            tenant_id: &req.tenant_id,
            location_code: &req.location_code,
            transaction_no: tx,
            transaction_reference_no: &req.transaction_reference_no,
            transaction_receipt_no: &req.transaction_receipt_no,
            transaction_receipt_amount: &req.transaction_receipt_amount,
            voucher_type: &req.voucher_type,
            voucher_value: &req.voucher_value,
            voucher_expiry_date: &req.voucher_expiry_date,
            customer_vehicle_type: &req.customer_vehicle_type,
            customer_vehicle_plate_no: &req.customer_vehicle_plate_no,
            customer_mobile_no: &req.customer_mobile_no,
            customer_email: &req.customer_email,
        }
        .sign(&location.secret_key);

        let post_request = json!({
            "login": location.login,
            "password": location.password,
            "locationCode": req.location_code,
            "transactionNo": tx,
            "transactionReferenceNo": req.transaction_reference_no,
            "voucherType": req.voucher_type,
            "voucherValue": req.voucher_value,
            "voucherExpiryDate": req.voucher_expiry_date,
            "customerVehicleType": req.customer_vehicle_type,
            "customerVehiclePlateNo": req.customer_vehicle_plate_no,
            "signature": signature,
        });

        let post_response = match self.call(&location, &url, &post_request, tx).await? {
            Ok(response) => response,
            Err(sealed) => return Ok(sealed),
        };
        if post_response.is_failed() {
            info!(transaction_no = tx, detail = ?post_response.message_detail, "Ticketing system refused the voucher");
            return self.fail(Rejection::InvalidTransaction).await;
        }

        let status = match post_response.data_str("voucherStatus") {
            Some(s) if s.eq_ignore_ascii_case("ISSUED") => RedemptionStatus::Issued,
            _ => RedemptionStatus::Redeemed,
        };
        let merchant_response = json!({
            "transactionNo": tx,
            "transactionReferenceNo": req.transaction_reference_no,
            "transactionReceiptNo": req.transaction_receipt_no,
            "voucherType": req.voucher_type,
            "voucherValue": req.voucher_value,
            "voucherStatus": status.as_str(),
            "gateInCode": post_response.data_str("gateInCode").unwrap_or_default(),
            "inTime": post_response.data_str("inTime").unwrap_or_default(),
            "duration": post_response.data_i64("duration").unwrap_or_default(),
            "tariff": post_response.data_i64("tariff").unwrap_or_default(),
        });

        let row = NewVoucherRedemption {
            company_name: location.company_name.clone(),
            merchant_id: req.merchant_id.clone(),
            tenant_id: req.tenant_id.clone(),
            location_code: req.location_code.clone(),
            transaction_no: tx.to_string(),
            transaction_reference_no: req.transaction_reference_no.clone(),
            transaction_receipt_no: req.transaction_receipt_no.clone(),
            transaction_receipt_amount: req.receipt_amount(),
            voucher_type: req.voucher_type.clone(),
            voucher_value: req.voucher_value.clone(),
            voucher_expiry_date: expiry,
            customer_vehicle_type: req.customer_vehicle_type.clone(),
            customer_vehicle_plate_no: req.customer_vehicle_plate_no.clone(),
            customer_mobile_no: req.customer_mobile_no.clone(),
            customer_email: req.customer_email.clone(),
            status,
            merchant_data_request: serde_json::to_string(&req)?,
            merchant_data_response: merchant_response.to_string(),
            post_data_request: post_request.to_string(),
            post_data_response: serde_json::to_string(&post_response)?,
            created_by: req.login.clone(),
        };

        match ctx.store.insert_redemption(&row).await? {
            RedemptionInsert::Inserted(id) => {
                info!(transaction_no = tx, redemption_id = id, status = status.as_str(), "Voucher redeemed");
            }
            RedemptionInsert::Duplicate => {
                warn!(transaction_no = tx, "Concurrent redemption won the insert");
                return self.fail(Rejection::DuplicateVoucher).await;
            }
        }

        let response = GatewayResponse::success("Transaction Success", SAVED, merchant_response);
        ctx.seal_value(&response, CODE_SUCCESS, &ctx.partner_key, StatusCode::CREATED)
            .await
    }

    async fn process_usage(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let req: VoucherUsageRequest = match self.open(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = req.transaction_no.as_str();

        let Some(redemption) = ctx
            .store
            .find_redemption_by_transaction(&req.location_code, tx)
            .await?
        else {
            return self.fail(Rejection::InvalidTransaction).await;
        };

        let Some(merchant) = ctx.store.find_by_store_code(&req.location_code).await? else {
            return self.fail(Rejection::InvalidLocation).await;
        };
        let Some(url) = ctx.route(&merchant, RoleKey::MerchantUsage).await? else {
            return self.fail(Rejection::AccessDenied).await;
        };

        let total_tariff = req.total_tariff_value().to_string();
        let signature = UsageFields {
            login: &merchant.login,
            password: &merchant.password,
            merchant_id: &merchant.merchant_code,
            location_code: &req.location_code,
            transaction_no: tx,
            license_plate_no: &req.license_plate_no,
            in_time: &req.in_time,
            gate_in_code: &req.gate_in_code,
            vehicle_type: &req.vehicle_type,
            total_tariff: &total_tariff,
            out_time: &req.out_time,
            gate_out_code: &req.gate_out_code,
        }
        .sign(&merchant.secret_key);

        let merchant_request = json!({
            "login": merchant.login,
            "password": merchant.password,
            "merchantID": merchant.merchant_code,
            "locationCode": req.location_code,
            "transactionNo": tx,
            "licensePlateNo": req.license_plate_no,
            "inTime": req.in_time,
            "gateInCode": req.gate_in_code,
            "vehicleType": req.vehicle_type,
            "totalTariff": req.total_tariff_value(),
            "outTime": req.out_time,
            "gateOutCode": req.gate_out_code,
            "signature": signature,
        });

        let merchant_response = match self.call(&merchant, &url, &merchant_request, tx).await? {
            Ok(response) => response,
            Err(sealed) => return Ok(sealed),
        };

        let usage = NewVoucherUsage {
            redemption_id: redemption.id,
            company_name: merchant.company_name.clone(),
            location_code: merchant.store_code.clone(),
            transaction_no: tx.to_string(),
            license_plate_no: req.license_plate_no.clone(),
            in_time: req.in_time.clone(),
            gate_in_code: req.gate_in_code.clone(),
            vehicle_type: req.vehicle_type.clone(),
            total_tariff: req.total_tariff_value(),
            out_time: req.out_time.clone(),
            gate_out_code: req.gate_out_code.clone(),
            merchant_data_request: merchant_request.to_string(),
            merchant_data_response: serde_json::to_string(&merchant_response)?,
            post_data_request: serde_json::to_string(&req)?,
            created_by: merchant.login.clone(),
        };
        let usage_id = ctx.store.insert_usage(&usage).await?;
        info!(transaction_no = tx, usage_id, redemption_id = redemption.id, "Voucher usage recorded");

        let response = GatewayResponse::success(
            "Transaction Success",
            SAVED,
            json!({
                "transactionNo": tx,
                "licensePlateNo": req.license_plate_no,
                "transactionStatus": "VALID",
            }),
        );
        ctx.seal_value(&response, CODE_SUCCESS, &ctx.partner_key, StatusCode::OK)
            .await
    }

    async fn process_inquiry(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let req: VoucherInquiryRequest = match self.open(body).await? {
            Ok(req) => req,
            Err(sealed) => return Ok(sealed),
        };
        let tx = req.transaction_no.as_str();

        let Some(merchant) = ctx.store.find_by_merchant_code(&req.merchant_id).await? else {
            return self.fail(Rejection::InvalidCredential).await;
        };
        let Some(url) = ctx.route(&merchant, RoleKey::PostInquiry).await? else {
            return self.fail(Rejection::AccessDenied).await;
        };

        let signature = VoucherInquiryFields {
            login: &merchant.login,
            password: &merchant.password,
            location_code: &req.location_code,
            transaction_no: tx,
        }
        .sign(&merchant.secret_key);

        let post_request = json!({
            "login": merchant.login,
            "password": merchant.password,
            "locationCode": req.location_code,
            "transactionNo": tx,
            "signature": signature,
        });

        let post_response = match self.call(&merchant, &url, &post_request, tx).await? {
            Ok(response) => response,
            Err(sealed) => return Ok(sealed),
        };
        if post_response.is_failed() {
            return self.fail(Rejection::InvalidTransaction).await;
        }

        let response = GatewayResponse::success(
            "Transaction Success",
            post_response.message_detail.clone().unwrap_or_default(),
            post_response.data,
        );
        ctx.seal_value(&response, CODE_SUCCESS, &ctx.partner_key, StatusCode::OK)
            .await
    }

    /// Seal `request` with the counterpart's key, post it and open the answer
    async fn call(
        &self,
        counterpart: &PartnerCredential,
        url: &str,
        request: &Value,
        transaction_no: &str,
    ) -> Result<Step<DownstreamResponse>> {
        let sealed = self
            .ctx
            .crypto
            .seal_json(request, &counterpart.gibberish_key)
            .await?;

        let reply = match self.client.post_envelope(url, &sealed).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(transaction_no, url, error = %e, "Voucher counterpart unreachable");
                return Ok(Err(self.fail(Rejection::DownstreamUnavailable).await?));
            }
        };

        let opened = match reply.ciphertext() {
            Some(cipher) => {
                self.ctx
                    .crypto
                    .open_json::<DownstreamResponse>(cipher, &counterpart.gibberish_key)
                    .await
            }
            None => None,
        };
        match opened {
            Some(response) => Ok(Ok(response)),
            None => {
                // The counterpart took the request and may have applied it; never retried
                error!(transaction_no, url, "Voucher counterpart answered with an unreadable envelope");
                Ok(Err(self.ctx.general_error(&self.ctx.partner_key).await?))
            }
        }
    }

    /// Validate and seal a redemption request, for merchant integration tests
    pub async fn generate_redemption(&self, req: &VoucherRedemptionRequest) -> Result<EncryptedPayload> {
        self.generate(req).await
    }

    /// Validate and seal a usage notification, for ticketing integration tests
    pub async fn generate_usage(&self, req: &VoucherUsageRequest) -> Result<EncryptedPayload> {
        self.generate(req).await
    }

    async fn generate<T: Serialize + Validate>(&self, req: &T) -> Result<EncryptedPayload> {
        if req.validate().is_err() {
            let failed = self.fail(Rejection::ValidationError).await?;
            return Ok(failed.payload);
        }
        let data = self.ctx.crypto.seal_json(req, &self.ctx.partner_key).await?;
        Ok(EncryptedPayload::new(data))
    }
}
