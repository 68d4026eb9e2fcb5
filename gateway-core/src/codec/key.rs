//! Daily key rotation

use crate::clock::Clock;
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::sync::Arc;

/// Passphrase for one party on one UTC day
#[derive(Clone, PartialEq, Eq)]
pub struct EnvelopeKey(String);

impl EnvelopeKey {
    /// Passphrase bytes fed to the key schedule
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the date prefix is safe to print
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "EnvelopeKey({prefix}***)")
    }
}

/// Derives envelope keys as `YYYYMMDD(as_of) || base_secret`
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    clock: Arc<dyn Clock>,
}

impl KeyDeriver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Key for an explicit UTC date
    pub fn derive(base_secret: &str, as_of: NaiveDate) -> EnvelopeKey {
        EnvelopeKey(format!("{}{}", as_of.format("%Y%m%d"), base_secret))
    }

    /// Key for the UTC day containing `at`
    pub fn derive_at(base_secret: &str, at: DateTime<Utc>) -> EnvelopeKey {
        Self::derive(base_secret, at.date_naive())
    }

    /// Key for the current UTC day of the injected clock
    pub fn current(&self, base_secret: &str) -> EnvelopeKey {
        Self::derive_at(base_secret, self.clock.now())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
