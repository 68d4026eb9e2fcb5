//! Response catalogue
//!
//! Business failures are answered in-band (HTTP 200, usually encrypted) with
//! a stable `responseCode`. Partners key their behaviour off these codes, so
//! they never change.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const CODE_SUCCESS: &str = "211000";
pub const CODE_FAILED: &str = "211001";
pub const CODE_FIELDS: &str = "211080";
pub const CODE_INVALID_PARTNER: &str = "911006";
pub const CODE_ACCESS_DENIED: &str = "401401";
pub const CODE_UNAVAILABLE: &str = "211503";
pub const CODE_GENERAL_ERROR: &str = "500500";

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILED: &str = "Failed";

/// Standard partner response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub response_status: String,
    pub response_code: String,
    pub response_description: String,
    pub message_detail: String,
    #[serde(default)]
    pub data: Value,
}

impl GatewayResponse {
    pub fn success(description: &str, detail: impl Into<String>, data: Value) -> Self {
        Self {
            response_status: STATUS_SUCCESS.to_string(),
            response_code: CODE_SUCCESS.to_string(),
            response_description: description.to_string(),
            message_detail: detail.into(),
            data,
        }
    }

    pub fn failed(code: &str, description: &str, detail: impl Into<String>, data: Value) -> Self {
        Self {
            response_status: STATUS_FAILED.to_string(),
            response_code: code.to_string(),
            response_description: description.to_string(),
            message_detail: detail.into(),
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_code == CODE_SUCCESS
    }
}

/// Short body used for server errors and header-auth failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortResponse {
    pub response_code: String,
    pub response_message: String,
}

impl ShortResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            response_code: code.to_string(),
            response_message: message.to_string(),
        }
    }

    pub fn general_error() -> Self {
        Self::new(CODE_GENERAL_ERROR, "General Server Error")
    }
}

/// Business rejection taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    MissingEnvelope,
    InvalidEnvelope,
    MissingFields,
    InvalidSignature,
    InvalidCredential,
    InvalidLocation,
    AccessDenied,
    InvalidAmount,
    InvalidTransaction,
    BillAlreadyPaid,
    CloseTicketUnpaid,
    CloseTicketClosed,
    DuplicateVoucher,
    DownstreamUnavailable,
    ValidationError,
}

impl Rejection {
    /// `(responseCode, responseDescription, messageDetail)`
    pub fn parts(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            Rejection::MissingEnvelope => (
                CODE_FAILED,
                "Invalid Transaction",
                "Please provide the encrypted data.",
            ),
            Rejection::InvalidEnvelope => (CODE_FAILED, "Invalid Transaction", "Invalid Data Encryption"),
            Rejection::MissingFields => (
                CODE_FIELDS,
                "All fields are required",
                "Please fill in all required fields.",
            ),
            Rejection::InvalidSignature => (
                CODE_FIELDS,
                "Invalid Signature",
                "The provided signature is invalid.",
            ),
            Rejection::InvalidCredential => (CODE_INVALID_PARTNER, "Invalid Partner", "Partner, Not Found"),
            Rejection::InvalidLocation => (CODE_FIELDS, "All fields are required", "Invalid Location Parking"),
            Rejection::AccessDenied => (CODE_ACCESS_DENIED, "Access Denied", "ACCESS_DENIED"),
            Rejection::InvalidAmount => (
                CODE_FAILED,
                "Invalid Transaction",
                "Invalid Amount, Please Inquiry your bill again",
            ),
            Rejection::InvalidTransaction => (CODE_FAILED, "Invalid Transaction", "The ticket is invalid"),
            Rejection::BillAlreadyPaid => (CODE_FAILED, "Invalid Transaction", "Bill already paid"),
            Rejection::CloseTicketUnpaid => (
                CODE_FAILED,
                "Invalid Transaction",
                "Ticket still has an outstanding balance",
            ),
            Rejection::CloseTicketClosed => (CODE_FAILED, "Invalid Transaction", "Ticket already closed"),
            Rejection::DuplicateVoucher => (CODE_FAILED, "Transaction Failed", "Voucher already used"),
            Rejection::DownstreamUnavailable => (
                CODE_UNAVAILABLE,
                "Service Unavailable",
                "Partner service is unavailable, please try again",
            ),
            Rejection::ValidationError => (CODE_FAILED, "Transaction Failed", "Invalid Transaction"),
        }
    }

    pub fn code(&self) -> &'static str {
        self.parts().0
    }

    /// Response carrying `data` (usually the transaction placeholder)
    pub fn respond(&self, data: Value) -> GatewayResponse {
        let (code, description, detail) = self.parts();
        GatewayResponse::failed(code, description, detail, data)
    }

    /// Response carrying the placeholder for `transaction_no`
    pub fn for_transaction(&self, transaction_no: &str) -> GatewayResponse {
        self.respond(placeholder_data(transaction_no))
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (code, _, detail) = self.parts();
        write!(f, "{code}: {detail}")
    }
}

/// Transaction data returned when no real ticket data is available
pub fn placeholder_data(transaction_no: &str) -> Value {
    json!({
        "transactionNo": transaction_no,
        "transactionStatus": "INVALID",
        "inTime": "",
        "duration": null,
        "tariff": null,
        "vehicleType": "",
        "outTime": "",
        "gracePeriod": null,
        "location": "",
        "paymentStatus": "UNPAID",
    })
}

/// Placeholder for a ticket already settled elsewhere
pub fn paid_placeholder_data(transaction_no: &str) -> Value {
    let mut data = placeholder_data(transaction_no);
    data["transactionStatus"] = json!("VALID");
    data["paymentStatus"] = json!("PAID");
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Rejection::InvalidSignature.code(), "211080");
        assert_eq!(Rejection::InvalidCredential.code(), "911006");
        assert_eq!(Rejection::InvalidAmount.code(), "211001");
        assert_eq!(Rejection::AccessDenied.code(), "401401");
    }

    #[test]
    fn test_placeholder_shape() {
        let r = Rejection::InvalidLocation.for_transaction("T1");
        let body = serde_json::to_value(&r).unwrap();
        assert_eq!(body["responseStatus"], "Failed");
        assert_eq!(body["messageDetail"], "Invalid Location Parking");
        assert_eq!(body["data"]["transactionNo"], "T1");
        assert_eq!(body["data"]["transactionStatus"], "INVALID");
        assert_eq!(body["data"]["paymentStatus"], "UNPAID");
        assert!(body["data"]["tariff"].is_null());
    }

    #[test]
    fn test_paid_placeholder() {
        let data = paid_placeholder_data("T2");
        assert_eq!(data["transactionStatus"], "VALID");
        assert_eq!(data["paymentStatus"], "PAID");
    }

    #[test]
    fn test_general_error_body() {
        let body = serde_json::to_value(ShortResponse::general_error()).unwrap();
        assert_eq!(body["responseCode"], "500500");
        assert_eq!(body["responseMessage"], "General Server Error");
    }
}
