pub mod auto_entry;
pub mod gateway;
pub mod location;
pub mod ticketing;
pub mod voucher;

pub use auto_entry::AutoEntryService;
pub use gateway::GatewayService;
pub use location::LocationService;
pub use ticketing::TicketingService;
pub use voucher::VoucherService;

use crate::crypto::CryptoService;
use crate::errors::Result;
use crate::metrics;
use crate::models::{EncryptedPayload, PartnerCredential};
use crate::repository::Store;
use actix_web::http::StatusCode;
use gateway_core::{Clock, GatewayResponse, Rejection, RoleKey, ShortResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Encrypted answer ready for the wire
#[derive(Debug, Clone)]
pub struct Sealed {
    pub status: StatusCode,
    pub payload: EncryptedPayload,
    /// Code inside the envelope, for logs and metrics
    pub response_code: String,
    pub rejection: Option<Rejection>,
}

impl Sealed {
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// Either the value a step produced or the answer that ends the request
pub type Step<T> = std::result::Result<T, Sealed>;

/// Dependencies shared by every service
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn Store>,
    pub crypto: CryptoService,
    pub clock: Arc<dyn Clock>,
    /// Secret shared with every partner for inbound envelopes
    pub partner_key: String,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("crypto", &self.crypto)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    pub fn new(store: Arc<dyn Store>, crypto: CryptoService, clock: Arc<dyn Clock>, partner_key: String) -> Self {
        Self {
            store,
            crypto,
            clock,
            partner_key,
        }
    }

    pub async fn seal_response(&self, response: &GatewayResponse, secret: &str) -> Result<Sealed> {
        self.seal_value(response, &response.response_code, secret, StatusCode::OK)
            .await
    }

    pub async fn seal_value<T: Serialize + ?Sized>(
        &self,
        value: &T,
        response_code: &str,
        secret: &str,
        status: StatusCode,
    ) -> Result<Sealed> {
        let data = self.crypto.seal_json(value, secret).await?;
        Ok(Sealed {
            status,
            payload: EncryptedPayload::new(data),
            response_code: response_code.to_string(),
            rejection: None,
        })
    }

    /// Rejection carrying the transaction placeholder
    pub async fn reject(&self, rejection: Rejection, transaction_no: &str, secret: &str) -> Result<Sealed> {
        debug!(code = rejection.code(), %rejection, transaction_no, "Rejecting request");
        let mut sealed = self
            .seal_response(&rejection.for_transaction(transaction_no), secret)
            .await?;
        sealed.rejection = Some(rejection);
        Ok(sealed)
    }

    /// Rejection carrying caller-chosen `data`
    pub async fn reject_with(&self, rejection: Rejection, data: Value, secret: &str) -> Result<Sealed> {
        let mut sealed = self.seal_response(&rejection.respond(data), secret).await?;
        sealed.rejection = Some(rejection);
        Ok(sealed)
    }

    /// Open an inbound envelope sealed with the shared partner key
    pub async fn open_envelope<T: DeserializeOwned>(&self, body: &EncryptedPayload) -> Result<Step<T>> {
        let Some(ciphertext) = body.ciphertext() else {
            return Ok(Err(self.reject(Rejection::MissingEnvelope, "", &self.partner_key).await?));
        };
        match self.crypto.open_json::<T>(ciphertext, &self.partner_key).await {
            Some(request) => Ok(Ok(request)),
            None => Ok(Err(self.reject(Rejection::InvalidEnvelope, "", &self.partner_key).await?)),
        }
    }

    pub async fn general_error(&self, secret: &str) -> Result<Sealed> {
        let body = ShortResponse::general_error();
        self.seal_value(&body, &body.response_code, secret, StatusCode::OK)
            .await
    }

    /// Downstream URL for `partner` under `key`, if the role pair exists
    pub async fn route(&self, partner: &PartnerCredential, key: RoleKey) -> Result<Option<String>> {
        let roles = self.store.roles(partner.id).await?;
        Ok(gateway_core::routing::resolve_url(&roles, key).map(str::to_string))
    }
}

/// Record the outcome of one partner-facing operation
pub(crate) fn observe(operation: &str, sealed: &Result<Sealed>) {
    let code = match sealed {
        Ok(s) => s.response_code.as_str(),
        Err(_) => gateway_core::response::CODE_GENERAL_ERROR,
    };
    metrics::record_response(operation, code);
}
