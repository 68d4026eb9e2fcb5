//! Error types for the gateway core

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Key material rejected by the cipher or MAC
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Plaintext could not be serialized before sealing
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Ticket has already been closed
    #[error("Ticket {0} already closed")]
    TicketClosed(String),

    /// Ticket still carries a tariff
    #[error("Ticket {transaction_no} has an outstanding tariff of {tariff}")]
    OutstandingBalance {
        /// Ticket number
        transaction_no: String,
        /// Tariff still owed
        tariff: i64,
    },

    /// Unknown enumeration value on the wire
    #[error("Unknown {kind}: {value}")]
    UnknownVariant {
        /// Enumeration name
        kind: &'static str,
        /// Offending value
        value: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
