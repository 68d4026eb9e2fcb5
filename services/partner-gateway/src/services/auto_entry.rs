//! Auto-entry membership check
//!
//! At the entry gate the ticketing system asks whether a licence plate
//! belongs to a mall membership holder. The gateway obtains an OAuth token
//! from the membership system, looks the plate up and records the exchange.

use super::{observe, Sealed, ServiceContext};
use crate::config::AutoEntryConfig;
use crate::errors::Result;
use crate::models::{field, AutoEntryRequest, EncryptedPayload, MembershipCheckLog};
use crate::partner_client::PartnerClient;
use gateway_core::codec::{AutoEntryFields, Signable};
use gateway_core::{GatewayResponse, Rejection};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use validator::Validate;

pub const CODE_NOT_MEMBER: &str = "211170";
const CREATED_BY: &str = "AUTO_ENTRY";

/// Placeholder data for auto-entry answers
pub fn auto_entry_placeholder(transaction_no: &str) -> Value {
    json!({
        "transactionNo": transaction_no,
        "licensePlateNo": "",
        "locationCode": "",
        "customerEmail": "",
        "status": "INVALID",
    })
}

/// Membership lookup verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Member { email: String },
    NotMember,
    /// Any other code the membership system answers with
    Unknown(String),
}

impl Membership {
    pub fn from_reply(body: &Value) -> Self {
        let code = match body.get("Code") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        match code.as_str() {
            "200" => Membership::Member {
                email: body
                    .get("EmailHide")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "404" => Membership::NotMember,
            _ => Membership::Unknown(code),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Membership::Member { .. } => "200",
            Membership::NotMember => "404",
            Membership::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoEntryService {
    ctx: ServiceContext,
    client: PartnerClient,
    settings: AutoEntryConfig,
}

impl AutoEntryService {
    pub fn new(ctx: ServiceContext, client: PartnerClient, settings: AutoEntryConfig) -> Self {
        Self { ctx, client, settings }
    }

    #[instrument(skip_all)]
    pub async fn check(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let result = self.process(body).await;
        observe("auto_entry", &result);
        result
    }

    async fn reject(&self, rejection: Rejection, transaction_no: &str, key: &str) -> Result<Sealed> {
        self.ctx
            .reject_with(rejection, auto_entry_placeholder(transaction_no), key)
            .await
    }

    async fn process(&self, body: &EncryptedPayload) -> Result<Sealed> {
        let ctx = &self.ctx;
        let partner_key = ctx.partner_key.as_str();

        let Some(cipher) = body.ciphertext() else {
            return self.reject(Rejection::MissingEnvelope, "", partner_key).await;
        };
        let Some(req) = ctx.crypto.open_json::<AutoEntryRequest>(cipher, partner_key).await else {
            return self.reject(Rejection::InvalidEnvelope, "", partner_key).await;
        };
        let tx = field(&req.transaction_no).to_string();

        if req.validate().is_err() {
            return self.reject(Rejection::MissingFields, &tx, partner_key).await;
        }
        if ctx
            .store
            .find_by_credentials(field(&req.login), field(&req.password))
            .await?
            .is_none()
        {
            return self.reject(Rejection::InvalidCredential, &tx, partner_key).await;
        }

        let Some(location) = ctx.store.find_by_store_code(field(&req.location_code)).await? else {
            return self.reject(Rejection::InvalidLocation, &tx, partner_key).await;
        };
        let reply_key = location.gibberish_key.as_str();

        let signed = AutoEntryFields {
            login: field(&req.login),
            password: field(&req.password),
            transaction_no: &tx,
            license_plate_no: field(&req.license_plate_no),
            location_code: field(&req.location_code),
        };
        if !signed.verify(&location.secret_key, field(&req.signature)) {
            return self.reject(Rejection::InvalidSignature, &tx, reply_key).await;
        }

        let Some(token) = self.fetch_token().await else {
            let response = GatewayResponse::failed(
                gateway_core::response::CODE_FAILED,
                "Error Establish Connection",
                "Failed to Get Token From Lippo Malls",
                auto_entry_placeholder(&tx),
            );
            return ctx.seal_response(&response, reply_key).await;
        };

        let qr_ticket = format!("{}?p1={}&p2={}", self.settings.ticket_url_base, location.nmid, tx);
        let lookup = json!({
            "LicenseNumber": field(&req.license_plate_no),
            "ParkingTicket": qr_ticket,
            "Location": location.company_name,
        });

        let reply = match self
            .client
            .post_json_bearer(&self.settings.membership_url, &lookup, &token)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(transaction_no = %tx, error = %e, "Membership service unavailable");
                return self.reject(Rejection::DownstreamUnavailable, &tx, reply_key).await;
            }
        };
        let reply_body = reply.json().unwrap_or(Value::Null);
        let membership = Membership::from_reply(&reply_body);

        let entry = MembershipCheckLog {
            company_name: location.company_name.clone(),
            nmid: location.nmid.clone(),
            location_code: location.store_code.clone(),
            transaction_no: tx.clone(),
            license_plate_no: field(&req.license_plate_no).to_string(),
            qr_ticket,
            response_code: membership.code().to_string(),
            response_status: matches!(membership, Membership::Member { .. }),
            merchant_data_request: lookup.to_string(),
            merchant_data_response: reply_body.to_string(),
            post_data_request: serde_json::to_string(&req)?,
            created_by: CREATED_BY.to_string(),
        };
        if let Err(e) = ctx.store.log_membership_check(&entry).await {
            error!(transaction_no = %tx, error = %e, "Failed to write membership check log");
        }

        let response = match membership {
            Membership::Member { email } => {
                info!(transaction_no = %tx, location = %location.store_code, "Plate belongs to a member");
                GatewayResponse::success(
                    "Transaction Success",
                    "The vehicle license plate is registered as valid Styles membership",
                    json!({
                        "transactionNo": tx,
                        "licensePlateNo": field(&req.license_plate_no),
                        "locationCode": field(&req.location_code),
                        "customerEmail": email,
                        "status": "VALID",
                    }),
                )
            }
            Membership::NotMember => GatewayResponse::failed(
                CODE_NOT_MEMBER,
                "Membership Data Is Not Found",
                "The vehicle license plate is not valid Styles membership (data not found)",
                auto_entry_placeholder(&tx),
            ),
            Membership::Unknown(code) => {
                warn!(transaction_no = %tx, code = %code, "Unexpected membership answer");
                return ctx.general_error(reply_key).await;
            }
        };
        ctx.seal_response(&response, reply_key).await
    }

    /// OAuth password grant against the membership system
    async fn fetch_token(&self) -> Option<String> {
        let form = [
            ("grant_type", self.settings.grant_type.as_str()),
            ("username", self.settings.username.as_str()),
            ("password", self.settings.password.as_str()),
        ];
        match self.client.post_form(&self.settings.token_url, &form).await {
            Ok(reply) => {
                let token = reply
                    .json()
                    .and_then(|body| body.get("access_token").and_then(Value::as_str).map(str::to_string));
                if token.is_none() {
                    warn!(status = reply.status, "Token response without access_token");
                }
                token
            }
            Err(e) => {
                warn!(error = %e, "Failed to get membership token");
                None
            }
        }
    }
}
