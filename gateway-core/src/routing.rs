//! Role-based routing of outbound calls
//!
//! A partner is *permitted* an operation when any of its roles carries the
//! access type. An outbound call is *routed* only by an exact
//! (role, access) pair that has a URL; there is no fallback.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleName {
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PAYMENT PARTNER")]
    PaymentPartner,
    #[serde(rename = "MERCHANT PARTNER")]
    MerchantPartner,
}

impl RoleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleName::Post => "POST",
            RoleName::PaymentPartner => "PAYMENT PARTNER",
            RoleName::MerchantPartner => "MERCHANT PARTNER",
        }
    }
}

impl FromStr for RoleName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(RoleName::Post),
            "PAYMENT PARTNER" => Ok(RoleName::PaymentPartner),
            "MERCHANT PARTNER" => Ok(RoleName::MerchantPartner),
            _ => Err(Error::UnknownVariant {
                kind: "role name",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    Inquiry,
    Payment,
    Redemption,
    Usage,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Inquiry => "INQUIRY",
            AccessType::Payment => "PAYMENT",
            AccessType::Redemption => "REDEMPTION",
            AccessType::Usage => "USAGE",
        }
    }
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INQUIRY" => Ok(AccessType::Inquiry),
            "PAYMENT" => Ok(AccessType::Payment),
            "REDEMPTION" => Ok(AccessType::Redemption),
            "USAGE" => Ok(AccessType::Usage),
            _ => Err(Error::UnknownVariant {
                kind: "access type",
                value: s.to_string(),
            }),
        }
    }
}

/// Every outbound route the gateway knows how to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKey {
    PostInquiry,
    PostPayment,
    PostRedemption,
    MerchantUsage,
    PaymentPartnerInquiry,
    PaymentPartnerPayment,
}

impl RoleKey {
    pub fn parts(&self) -> (RoleName, AccessType) {
        match self {
            RoleKey::PostInquiry => (RoleName::Post, AccessType::Inquiry),
            RoleKey::PostPayment => (RoleName::Post, AccessType::Payment),
            RoleKey::PostRedemption => (RoleName::Post, AccessType::Redemption),
            RoleKey::MerchantUsage => (RoleName::MerchantPartner, AccessType::Usage),
            RoleKey::PaymentPartnerInquiry => (RoleName::PaymentPartner, AccessType::Inquiry),
            RoleKey::PaymentPartnerPayment => (RoleName::PaymentPartner, AccessType::Payment),
        }
    }
}

impl fmt::Display for RoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (role, access) = self.parts();
        write!(f, "{}/{}", role.as_str(), access.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerRole {
    pub role_name: RoleName,
    pub access_type: AccessType,
    pub url_access: Option<String>,
}

impl PartnerRole {
    pub fn new(role_name: RoleName, access_type: AccessType, url_access: Option<&str>) -> Self {
        Self {
            role_name,
            access_type,
            url_access: url_access.map(str::to_string),
        }
    }
}

/// Whether any role grants `access`
pub fn has_access(roles: &[PartnerRole], access: AccessType) -> bool {
    roles.iter().any(|r| r.access_type == access)
}

/// Downstream URL for the exact role pair, if configured
pub fn resolve_url(roles: &[PartnerRole], key: RoleKey) -> Option<&str> {
    let (role_name, access_type) = key.parts();
    roles
        .iter()
        .find(|r| r.role_name == role_name && r.access_type == access_type)
        .and_then(|r| r.url_access.as_deref())
        .map(str::trim)
        .filter(|url| !url.is_empty())
}
