//! MD5 request signatures
//!
//! Each message type signs the concatenation of a fixed list of fields
//! followed by the shared secret. Field order is part of the wire protocol.

use md5::{Digest, Md5};
use subtle::ConstantTimeEq;

/// Lowercase hex MD5 over the concatenated parts
pub fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Case-insensitive constant-time comparison of two hex signatures
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    let expected = expected.trim().to_ascii_lowercase();
    let provided = provided.trim().to_ascii_lowercase();
    expected.len() == provided.len() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

/// A message with a fixed signed-field order
pub trait Signable {
    /// Signed fields in protocol order, secret excluded
    fn signed_fields(&self) -> Vec<&str>;

    fn sign(&self, secret: &str) -> String {
        let mut parts = self.signed_fields();
        parts.push(secret);
        md5_hex(&parts)
    }

    fn verify(&self, secret: &str, provided: &str) -> bool {
        signatures_match(&self.sign(secret), provided)
    }
}

/// Partner inquiry
#[derive(Debug, Clone, Copy)]
pub struct InquiryFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub store_id: &'a str,
    pub transaction_no: &'a str,
}

impl Signable for InquiryFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![self.login, self.password, self.store_id, self.transaction_no]
    }
}

/// Partner payment confirmation
#[derive(Debug, Clone, Copy)]
pub struct PaymentFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub store_id: &'a str,
    pub transaction_no: &'a str,
    pub reference_no: &'a str,
    pub amount: &'a str,
    pub payment_status: &'a str,
    pub payment_reference_no: &'a str,
    pub payment_date: &'a str,
    pub issuer_id: &'a str,
    pub retrieval_reference_no: &'a str,
    pub approval_code: &'a str,
}

impl Signable for PaymentFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![
            self.login,
            self.password,
            self.store_id,
            self.transaction_no,
            self.reference_no,
            self.amount,
            self.payment_status,
            self.payment_reference_no,
            self.payment_date,
            self.issuer_id,
            self.retrieval_reference_no,
            self.approval_code,
        ]
    }
}

/// Payment forwarded to a location's ticketing system.
///
/// Carries neither the store ID nor the approval code.
#[derive(Debug, Clone, Copy)]
pub struct PostPaymentFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub transaction_no: &'a str,
    pub reference_no: &'a str,
    pub amount: &'a str,
    pub payment_status: &'a str,
    pub payment_reference_no: &'a str,
    pub payment_date: &'a str,
    pub issuer_id: &'a str,
    pub retrieval_reference_no: &'a str,
}

impl Signable for PostPaymentFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![
            self.login,
            self.password,
            self.transaction_no,
            self.reference_no,
            self.amount,
            self.payment_status,
            self.payment_reference_no,
            self.payment_date,
            self.issuer_id,
            self.retrieval_reference_no,
        ]
    }
}

/// Auto-entry membership check; signed with the location secret
#[derive(Debug, Clone, Copy)]
pub struct AutoEntryFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub transaction_no: &'a str,
    pub license_plate_no: &'a str,
    pub location_code: &'a str,
}

impl Signable for AutoEntryFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![
            self.login,
            self.password,
            self.transaction_no,
            self.license_plate_no,
            self.location_code,
        ]
    }
}

/// Ticket inquiry made on behalf of a voucher merchant
#[derive(Debug, Clone, Copy)]
pub struct VoucherInquiryFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub location_code: &'a str,
    pub transaction_no: &'a str,
}

impl Signable for VoucherInquiryFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![self.login, self.password, self.location_code, self.transaction_no]
    }
}

/// Voucher redemption forwarded to the ticketing system
#[derive(Debug, Clone, Copy)]
pub struct RedemptionFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub merchant_id: &'a str,
    pub tenant_id: &'a str,
    pub location_code: &'a str,
    pub transaction_no: &'a str,
    pub transaction_reference_no: &'a str,
    pub transaction_receipt_no: &'a str,
    pub transaction_receipt_amount: &'a str,
    pub voucher_type: &'a str,
    pub voucher_value: &'a str,
    pub voucher_expiry_date: &'a str,
    pub customer_vehicle_type: &'a str,
    pub customer_vehicle_plate_no: &'a str,
    pub customer_mobile_no: &'a str,
    pub customer_email: &'a str,
}

impl Signable for RedemptionFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![
            self.login,
            self.password,
            self.merchant_id,
            self.tenant_id,
            self.location_code,
            self.transaction_no,
            self.transaction_reference_no,
            self.transaction_receipt_no,
            self.transaction_receipt_amount,
            self.voucher_type,
            self.voucher_value,
            self.voucher_expiry_date,
            self.customer_vehicle_type,
            self.customer_vehicle_plate_no,
            self.customer_mobile_no,
            self.customer_email,
        ]
    }
}

/// Voucher usage notification sent to the merchant
#[derive(Debug, Clone, Copy)]
pub struct UsageFields<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub merchant_id: &'a str,
    pub location_code: &'a str,
    pub transaction_no: &'a str,
    pub license_plate_no: &'a str,
    pub in_time: &'a str,
    pub gate_in_code: &'a str,
    pub vehicle_type: &'a str,
    pub total_tariff: &'a str,
    pub out_time: &'a str,
    pub gate_out_code: &'a str,
}

impl Signable for UsageFields<'_> {
    fn signed_fields(&self) -> Vec<&str> {
        vec![
            self.login,
            self.password,
            self.merchant_id,
            self.location_code,
            self.transaction_no,
            self.license_plate_no,
            self.in_time,
            self.gate_in_code,
            self.vehicle_type,
            self.total_tariff,
            self.out_time,
            self.gate_out_code,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inquiry() -> InquiryFields<'static> {
        InquiryFields {
            login: "partner",
            password: "pw",
            store_id: "ID1020",
            transaction_no: "123456789012F007SK",
        }
    }

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(md5_hex(&["abc"]), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(md5_hex(&["a", "bc"]), md5_hex(&["abc"]));
    }

    #[test]
    fn test_inquiry_signature_is_concatenation() {
        let expected = md5_hex(&["partnerpwID1020123456789012F007SKsecret"]);
        assert_eq!(inquiry().sign("secret"), expected);
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let sig = inquiry().sign("secret").to_uppercase();
        assert!(inquiry().verify("secret", &sig));
        assert!(!inquiry().verify("other", &sig));
    }

    #[test]
    fn test_every_field_matters() {
        let base = inquiry().sign("secret");
        let mut changed = inquiry();
        changed.store_id = "ID1021";
        assert_ne!(changed.sign("secret"), base);
        let mut changed = inquiry();
        changed.transaction_no = "123456789013F007SK";
        assert_ne!(changed.sign("secret"), base);
    }

    #[test]
    fn test_post_payment_omits_store_and_approval() {
        let payment = PaymentFields {
            login: "l",
            password: "p",
            store_id: "S",
            transaction_no: "T",
            reference_no: "R",
            amount: "5000",
            payment_status: "PAID",
            payment_reference_no: "PR",
            payment_date: "2024-01-01 10:00:00",
            issuer_id: "I",
            retrieval_reference_no: "RR",
            approval_code: "A",
        };
        let post = PostPaymentFields {
            login: "l",
            password: "p",
            transaction_no: "T",
            reference_no: "R",
            amount: "5000",
            payment_status: "PAID",
            payment_reference_no: "PR",
            payment_date: "2024-01-01 10:00:00",
            issuer_id: "I",
            retrieval_reference_no: "RR",
        };
        assert_eq!(payment.signed_fields().len(), 12);
        assert_eq!(post.signed_fields().len(), 10);
        assert_eq!(
            post.sign("s"),
            md5_hex(&["lpTR5000PAIDPR2024-01-01 10:00:00IRRs"])
        );
    }

    #[test]
    fn test_signatures_match_rejects_length_mismatch() {
        assert!(!signatures_match("abcd", "abc"));
        assert!(signatures_match(" ABCD ", "abcd"));
    }
}
