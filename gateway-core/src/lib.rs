//! Partner gateway core
//!
//! Protocol primitives shared by every flow of the parking partner gateway.
//!
//! # Architecture
//!
//! - **Codec**: daily-rotated passphrase envelopes plus MD5 / HMAC signatures
//! - **Tariff**: ticket state machine with grace-period accrual
//! - **Breaker**: per-endpoint circuit breaker guarding downstream partners
//! - **Routing**: role/access resolution for outbound calls
//! - **Response**: the stable response-code catalogue
//!
//! # Invariants
//!
//! - An envelope sealed on one UTC day only opens with the same day's key
//! - A signature changes when any signed field changes
//! - Tariff never exceeds `floor(elapsed / grace) * UNIT_RATE`
//! - No outbound call is made while its endpoint circuit is open

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod breaker;
pub mod clock;
pub mod codec;
pub mod error;
pub mod response;
pub mod routing;
pub mod tariff;

// Re-exports
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, EndpointKey, Unavailable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Envelope, EnvelopeKey, KeyDeriver};
pub use error::{Error, Result};
pub use response::{GatewayResponse, Rejection, ShortResponse};
pub use routing::{AccessType, PartnerRole, RoleKey, RoleName};
pub use tariff::{Ticket, TicketPhase, TicketStatus, VehicleType};
