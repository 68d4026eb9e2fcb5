//! Header HMAC authentication
//!
//! Clients send `clientkey`, `timestamp` and `signature` headers where
//! `signature = base64(HMAC-SHA256(secret, "clientkey|timestamp"))`.

use crate::clock::parse_local;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of a header signature check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCheck {
    Valid,
    /// No secret registered for the clientkey
    UnknownClient,
    InvalidSignature,
}

fn mac_for(secret: &str, clientkey: &str, timestamp: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    mac.update(format!("{clientkey}|{timestamp}").as_bytes());
    Ok(mac)
}

/// Compute the header signature a client is expected to send
pub fn sign_header(secret: &str, clientkey: &str, timestamp: &str) -> Result<String> {
    let mac = mac_for(secret, clientkey, timestamp)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verify a header signature in constant time.
///
/// `secret` is `None` when the clientkey is not registered; an empty
/// registered secret is treated the same way.
pub fn verify_header(
    secret: Option<&str>,
    clientkey: &str,
    timestamp: &str,
    signature: &str,
) -> HeaderCheck {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return HeaderCheck::UnknownClient,
    };
    let provided = match STANDARD.decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return HeaderCheck::InvalidSignature,
    };
    match mac_for(secret, clientkey, timestamp) {
        Ok(mac) if mac.clone().verify_slice(&provided).is_ok() => HeaderCheck::Valid,
        _ => HeaderCheck::InvalidSignature,
    }
}

/// Whether `timestamp` lies within `window` of `now` in either direction.
///
/// Accepts RFC 3339 or the location wall-clock format; anything else is
/// outside the window.
pub fn timestamp_within_window(timestamp: &str, now: DateTime<Utc>, window: Duration) -> bool {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_local(timestamp));
    match parsed {
        Some(at) => (now - at).num_seconds().abs() <= window.num_seconds(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sign_and_verify() {
        let sig = sign_header("secret", "client-1", "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(
            verify_header(Some("secret"), "client-1", "2024-01-01T00:00:00Z", &sig),
            HeaderCheck::Valid
        );
    }

    #[test]
    fn test_rejects_mismatch_and_missing_secret() {
        let sig = sign_header("secret", "client-1", "t").unwrap();
        assert_eq!(
            verify_header(Some("secret"), "client-1", "t2", &sig),
            HeaderCheck::InvalidSignature
        );
        assert_eq!(
            verify_header(Some("secret"), "client-1", "t", "%%%"),
            HeaderCheck::InvalidSignature
        );
        assert_eq!(verify_header(None, "client-1", "t", &sig), HeaderCheck::UnknownClient);
        assert_eq!(verify_header(Some(""), "client-1", "t", &sig), HeaderCheck::UnknownClient);
    }

    #[test]
    fn test_timestamp_window() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let window = Duration::minutes(20);
        assert!(timestamp_within_window("2024-01-01T11:45:00Z", now, window));
        assert!(!timestamp_within_window("2024-01-01T11:30:00Z", now, window));
        // 19:10 WIB is 12:10 UTC
        assert!(timestamp_within_window("2024-01-01 19:10:00", now, window));
        assert!(!timestamp_within_window("yesterday", now, window));
    }
}
