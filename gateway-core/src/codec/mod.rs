//! Envelope codec
//!
//! Every partner-facing payload travels as `{ "data": "<ciphertext>" }`.
//! The ciphertext key is the UTC date (`YYYYMMDD`) prefixed to a per-party
//! secret, so keys rotate at midnight UTC without coordination. Inside the
//! envelope, MD5 signatures over fixed field orders prove the sender knows
//! the shared secret.

pub mod envelope;
pub mod header;
pub mod key;
pub mod signature;

pub use envelope::Envelope;
pub use header::{sign_header, timestamp_within_window, verify_header, HeaderCheck};
pub use key::{EnvelopeKey, KeyDeriver};
pub use signature::{
    md5_hex, signatures_match, AutoEntryFields, InquiryFields, PaymentFields, PostPaymentFields,
    RedemptionFields, Signable, UsageFields, VoucherInquiryFields,
};
