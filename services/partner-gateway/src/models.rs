use chrono::{DateTime, NaiveDate, Utc};
use gateway_core::{
    routing::{AccessType, PartnerRole, RoleName},
    tariff::{Ticket, TicketStatus, VehicleType},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::str::FromStr;
use validator::{Validate, ValidationError};

// ===== Envelope =====

/// Wire envelope `{ "data": "<ciphertext>" }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(default)]
    pub data: Option<String>,
}

impl EncryptedPayload {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    /// Ciphertext when present and non-blank
    pub fn ciphertext(&self) -> Option<&str> {
        self.data.as_deref().map(str::trim).filter(|d| !d.is_empty())
    }
}

/// Decrypted downstream answer; every field is optional on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamResponse {
    #[serde(default)]
    pub response_status: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    pub response_code: Option<String>,
    #[serde(default)]
    pub response_description: Option<String>,
    #[serde(default)]
    pub message_detail: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl DownstreamResponse {
    pub fn is_failed(&self) -> bool {
        self.response_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("failed"))
            .unwrap_or(false)
    }

    /// Numeric field from `data`, whether sent as number or string
    pub fn data_i64(&self, field: &str) -> Option<i64> {
        match self.data.get(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }
}

/// Lenient string fields: partners send amounts and codes as either JSON
/// strings or numbers, and signatures are computed over the text form.
pub mod loose {
    use super::*;

    pub fn opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(other) => Some(other.to_string()),
        })
    }
}

/// Borrow a validated required field
pub fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

// ===== Partner directory =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartnerCredential {
    pub id: i64,
    pub company_name: String,
    /// Merchant code (MPAN)
    pub merchant_code: String,
    pub nmid: String,
    pub store_code: String,
    pub login: String,
    pub password: String,
    /// Feeds MD5 signatures
    pub secret_key: String,
    /// Feeds envelope keys
    pub gibberish_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartnerRoleRow {
    pub partner_id: i64,
    pub role_name: String,
    pub access_type: String,
    pub url_access: Option<String>,
}

impl PartnerRoleRow {
    /// Rows with unknown role or access names are dropped
    pub fn into_role(self) -> Option<PartnerRole> {
        let role_name = RoleName::from_str(&self.role_name).ok()?;
        let access_type = AccessType::from_str(&self.access_type).ok()?;
        Some(PartnerRole {
            role_name,
            access_type,
            url_access: self.url_access,
        })
    }
}

// ===== Tickets =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketRow {
    pub transaction_no: String,
    pub tariff: i64,
    pub grace_period: i64,
    pub vehicle_type: String,
    pub status: String,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub ticket_close: bool,
    pub reference_no: Option<String>,
    pub version: i64,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = gateway_core::Error;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(Ticket {
            transaction_no: row.transaction_no,
            tariff: row.tariff,
            grace_period: row.grace_period,
            vehicle_type: VehicleType::from_str(&row.vehicle_type)?,
            status: TicketStatus::from_str(&row.status)?,
            in_time: row.in_time,
            out_time: row.out_time,
            paid_at: row.paid_at,
            closed: row.ticket_close,
            reference_no: row.reference_no,
            version: row.version,
        })
    }
}

// ===== Audit rows =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InquiryLog {
    pub company_name: String,
    pub nmid: String,
    pub store_code: String,
    pub transaction_no: String,
    pub data_send: String,
    pub data_response: String,
    pub data_detail_response: String,
    pub project_category_id: i32,
    pub project_category_name: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmationLog {
    pub company_name: String,
    pub nmid: String,
    pub store_code: String,
    pub transaction_no: String,
    pub reference_no: String,
    pub amount: String,
    pub payment_status: String,
    pub merchant_data_request: String,
    pub merchant_data_response: String,
    pub post_data_request: String,
    pub post_data_response: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionStatus {
    Issued,
    Redeemed,
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Issued => "ISSUED",
            RedemptionStatus::Redeemed => "REDEEMED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVoucherRedemption {
    pub company_name: String,
    pub merchant_id: String,
    pub tenant_id: String,
    pub location_code: String,
    pub transaction_no: String,
    pub transaction_reference_no: String,
    pub transaction_receipt_no: String,
    pub transaction_receipt_amount: Decimal,
    pub voucher_type: String,
    pub voucher_value: String,
    pub voucher_expiry_date: NaiveDate,
    pub customer_vehicle_type: String,
    pub customer_vehicle_plate_no: String,
    pub customer_mobile_no: String,
    pub customer_email: String,
    pub status: RedemptionStatus,
    pub merchant_data_request: String,
    pub merchant_data_response: String,
    pub post_data_request: String,
    pub post_data_response: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VoucherRedemptionRow {
    pub id: i64,
    pub merchant_id: String,
    pub location_code: String,
    pub transaction_no: String,
    pub transaction_reference_no: String,
    pub transaction_receipt_no: String,
    pub transaction_receipt_amount: Decimal,
    pub voucher_type: String,
    pub voucher_value: String,
    pub status: String,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVoucherUsage {
    pub redemption_id: i64,
    pub company_name: String,
    pub location_code: String,
    pub transaction_no: String,
    pub license_plate_no: String,
    pub in_time: String,
    pub gate_in_code: String,
    pub vehicle_type: String,
    pub total_tariff: i64,
    pub out_time: String,
    pub gate_out_code: String,
    pub merchant_data_request: String,
    pub merchant_data_response: String,
    pub post_data_request: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipCheckLog {
    pub company_name: String,
    pub nmid: String,
    pub location_code: String,
    pub transaction_no: String,
    pub license_plate_no: String,
    pub qr_ticket: String,
    pub response_code: String,
    pub response_status: bool,
    pub merchant_data_request: String,
    pub merchant_data_response: String,
    pub post_data_request: String,
    pub created_by: String,
}

// ===== Locations =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub location_code: String,
    pub location_name: String,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LocationLot {
    pub lot_name: String,
    pub vehicle_type: String,
    pub max_lot: i32,
    pub used_lot: i32,
    pub available_lot: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationDetail {
    #[serde(flatten)]
    pub location: Location,
    pub lots: Vec<LocationLot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyLocation {
    #[serde(flatten)]
    pub location: Location,
    pub distance_km: f64,
    pub lots: Vec<LocationLot>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NearbyLocationRequest {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    /// Kilometres
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_radius_km")]
    pub radius: f64,
}

fn default_radius_km() -> f64 {
    5.0
}

// ===== Decrypted partner requests =====

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InquiryRequest {
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub login: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub password: Option<String>,
    #[serde(rename = "storeID", default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub store_id: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub transaction_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub login: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub password: Option<String>,
    #[serde(rename = "storeID", default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub store_id: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub transaction_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub reference_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub amount: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub payment_status: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub payment_reference_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub payment_date: Option<String>,
    #[serde(rename = "issuerID", default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub issuer_id: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub retrieval_reference_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub approval_code: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub signature: Option<String>,
}

impl PaymentRequest {
    /// Amount as an integer tariff; fractional or non-numeric amounts never match
    pub fn amount_value(&self) -> Option<i64> {
        let raw = field(&self.amount).trim();
        Decimal::from_str(raw)
            .ok()
            .filter(|d| d.fract().is_zero())
            .and_then(|d| i64::try_from(d).ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CloseTicketRequest {
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub login: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub transaction_no: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTicketRequest {
    #[serde(default)]
    #[validate(custom = "validate_vehicle_type")]
    pub vehicle_type: Option<String>,
    #[serde(default)]
    #[validate(range(min = 1, max = 1440))]
    pub grace_period: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AutoEntryRequest {
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub login: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub transaction_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub license_plate_no: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub location_code: Option<String>,
    #[serde(default, deserialize_with = "loose::opt")]
    #[validate(required, length(min = 1))]
    pub signature: Option<String>,
}

/// Plain-text helper requests used by partners to test their signing
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInquiryRequest {
    #[validate(length(min = 1))]
    pub login: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(rename = "storeID")]
    #[validate(length(min = 1))]
    pub store_id: String,
    #[validate(length(min = 1))]
    pub transaction_no: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePaymentRequest {
    #[validate(length(min = 1))]
    pub login: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(rename = "storeID")]
    pub store_id: String,
    pub transaction_no: String,
    pub reference_no: String,
    #[serde(deserialize_with = "loose_required")]
    pub amount: String,
    pub payment_status: String,
    pub payment_reference_no: String,
    pub payment_date: String,
    #[serde(rename = "issuerID")]
    pub issuer_id: String,
    pub retrieval_reference_no: String,
    pub approval_code: String,
}

fn loose_required<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    loose::opt(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing value"))
}

// ===== Voucher requests =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherType {
    Amount,
    Duration,
}

fn validate_voucher_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "AMOUNT" | "DURATION" => Ok(()),
        _ => Err(ValidationError::new("voucher_type")),
    }
}

fn validate_vehicle_type(value: &str) -> Result<(), ValidationError> {
    VehicleType::from_str(value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("vehicle_type"))
}

fn validate_strict_vehicle_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "MOBIL" | "MOTOR" => Ok(()),
        _ => Err(ValidationError::new("vehicle_type")),
    }
}

fn validate_iso_date(value: &str) -> Result<(), ValidationError> {
    parse_iso_date(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("iso_date"))
}

fn validate_decimal(value: &str) -> Result<(), ValidationError> {
    Decimal::from_str(value.trim())
        .map(|_| ())
        .map_err(|_| ValidationError::new("numeric"))
}

fn validate_local_timestamp(value: &str) -> Result<(), ValidationError> {
    gateway_core::clock::parse_local(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("timestamp_format"))
}

fn validate_non_negative(value: &str) -> Result<(), ValidationError> {
    match Decimal::from_str(value.trim()) {
        Ok(d) if !d.is_sign_negative() => Ok(()),
        _ => Err(ValidationError::new("non_negative")),
    }
}

/// ISO 8601 date or date-time
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoucherRedemptionRequest {
    #[validate(length(min = 1))]
    #[serde(default)]
    pub login: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub password: String,
    #[serde(rename = "merchantID", default)]
    #[validate(length(min = 1))]
    pub merchant_id: String,
    #[serde(rename = "tenantID", default)]
    #[validate(length(min = 1))]
    pub tenant_id: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub location_code: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub transaction_no: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub transaction_reference_no: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub transaction_receipt_no: String,
    #[validate(length(min = 1), custom = "validate_decimal")]
    #[serde(default, deserialize_with = "loose_or_empty")]
    pub transaction_receipt_amount: String,
    #[validate(custom = "validate_voucher_type")]
    #[serde(default)]
    pub voucher_type: String,
    #[validate(length(min = 1), custom = "validate_decimal")]
    #[serde(default, deserialize_with = "loose_or_empty")]
    pub voucher_value: String,
    #[validate(custom = "validate_iso_date")]
    #[serde(default)]
    pub voucher_expiry_date: String,
    #[serde(default)]
    pub customer_vehicle_type: String,
    #[serde(default)]
    pub customer_vehicle_plate_no: String,
    #[serde(default)]
    pub customer_mobile_no: String,
    #[serde(default)]
    pub customer_email: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub signature: String,
}

impl VoucherRedemptionRequest {
    pub fn receipt_amount(&self) -> Decimal {
        Decimal::from_str(self.transaction_receipt_amount.trim()).unwrap_or_default()
    }

    pub fn expiry_date(&self) -> Option<NaiveDate> {
        parse_iso_date(&self.voucher_expiry_date)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoucherUsageRequest {
    #[validate(length(min = 1))]
    #[serde(default)]
    pub login: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub password: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub location_code: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub transaction_no: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub license_plate_no: String,
    #[validate(custom = "validate_local_timestamp")]
    #[serde(default)]
    pub in_time: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub gate_in_code: String,
    #[validate(custom = "validate_strict_vehicle_type")]
    #[serde(default)]
    pub vehicle_type: String,
    #[validate(custom = "validate_non_negative")]
    #[serde(default, deserialize_with = "loose_or_empty")]
    pub total_tariff: String,
    #[validate(custom = "validate_local_timestamp")]
    #[serde(default)]
    pub out_time: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub gate_out_code: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub signature: String,
}

impl VoucherUsageRequest {
    pub fn total_tariff_value(&self) -> i64 {
        Decimal::from_str(self.total_tariff.trim())
            .ok()
            .and_then(|d| i64::try_from(d.trunc()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoucherInquiryRequest {
    #[validate(length(min = 1))]
    #[serde(default)]
    pub login: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub password: String,
    #[serde(rename = "merchantID", default)]
    #[validate(length(min = 1))]
    pub merchant_id: String,
    #[serde(rename = "tenantID", default)]
    pub tenant_id: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub location_code: String,
    #[validate(length(min = 1))]
    #[serde(default)]
    pub transaction_no: String,
    #[serde(default)]
    pub signature: String,
}

fn loose_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(loose::opt(deserializer)?.unwrap_or_default())
}

// ===== Health =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub time: String,
    pub message: String,
    pub response_time_ms: u128,
}
