//! Ticket tariff state machine
//!
//! ```text
//! UNPAID (accruing) --mark_paid--> PAID (frozen 30 min) --accrue--> UNPAID ...
//!        \                                  |
//!         +------------- close (tariff 0) --+--> CLOSED (terminal)
//! ```
//!
//! All operations are pure; persistence applies them under an optimistic
//! version check.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tariff charged per completed grace period
pub const UNIT_RATE: i64 = 5000;

/// Grace period applied when a ticket carries none
pub const DEFAULT_GRACE_MINUTES: i64 = 5;

/// Window after payment during which the tariff does not accrue
pub const PAID_FREEZE_MINUTES: i64 = 30;

/// Location suffix of generated ticket numbers
pub const TICKET_SUFFIX: &str = "F007SK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Unpaid,
    Paid,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Unpaid => "UNPAID",
            TicketStatus::Paid => "PAID",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNPAID" => Ok(TicketStatus::Unpaid),
            "PAID" => Ok(TicketStatus::Paid),
            _ => Err(Error::UnknownVariant {
                kind: "ticket status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    Mobil,
    Motor,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Mobil => "MOBIL",
            VehicleType::Motor => "MOTOR",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MOBIL" => Ok(VehicleType::Mobil),
            "MOTOR" => Ok(VehicleType::Motor),
            _ => Err(Error::UnknownVariant {
                kind: "vehicle type",
                value: s.to_string(),
            }),
        }
    }
}

/// What an inquiry should report for a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketPhase {
    /// Paid and still inside the exit window
    PaidFrozen,
    /// Vehicle has left
    Closed,
    /// Inside the first grace period, nothing owed
    Free,
    /// Tariff owed
    Due(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub transaction_no: String,
    pub tariff: i64,
    /// Minutes per billing period
    pub grace_period: i64,
    pub vehicle_type: VehicleType,
    pub status: TicketStatus,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub closed: bool,
    pub reference_no: Option<String>,
    /// Optimistic concurrency guard, bumped by every persisted change
    pub version: i64,
}

impl Ticket {
    pub fn issue(
        transaction_no: impl Into<String>,
        grace_period: i64,
        vehicle_type: VehicleType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_no: transaction_no.into(),
            tariff: 0,
            grace_period,
            vehicle_type,
            status: TicketStatus::Unpaid,
            in_time: now,
            out_time: None,
            paid_at: None,
            closed: false,
            reference_no: None,
            version: 0,
        }
    }

    /// Grace period in effect; non-positive values fall back to the default
    pub fn effective_grace(&self) -> i64 {
        if self.grace_period > 0 {
            self.grace_period
        } else {
            DEFAULT_GRACE_MINUTES
        }
    }

    /// Whole minutes since entry, never negative
    pub fn duration_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.in_time).num_minutes().max(0)
    }

    /// `floor(elapsed / grace) * UNIT_RATE`
    pub fn expected_tariff(&self, now: DateTime<Utc>) -> i64 {
        let periods = self.duration_minutes(now) / self.effective_grace();
        periods.saturating_mul(UNIT_RATE)
    }

    pub fn is_payment_frozen(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.paid_at) {
            (TicketStatus::Paid, Some(paid_at)) => now < paid_at + Duration::minutes(PAID_FREEZE_MINUTES),
            _ => false,
        }
    }

    pub fn is_within_grace(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Unpaid && self.duration_minutes(now) < self.effective_grace()
    }

    /// Raise the tariff to what elapsed time dictates.
    ///
    /// Returns whether anything changed. Never lowers the tariff, never
    /// touches a closed ticket or one inside its post-payment freeze.
    pub fn accrue(&mut self, now: DateTime<Utc>) -> bool {
        if self.closed || self.is_payment_frozen(now) {
            return false;
        }
        let expected = self.expected_tariff(now);
        if expected > self.tariff {
            self.tariff = expected;
            self.status = TicketStatus::Unpaid;
            true
        } else {
            false
        }
    }

    pub fn mark_paid(&mut self, now: DateTime<Utc>, reference_no: impl Into<String>) {
        self.tariff = 0;
        self.status = TicketStatus::Paid;
        self.out_time = Some(now);
        self.paid_at = Some(now);
        self.reference_no = Some(reference_no.into());
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::TicketClosed(self.transaction_no.clone()));
        }
        if self.tariff != 0 {
            return Err(Error::OutstandingBalance {
                transaction_no: self.transaction_no.clone(),
                tariff: self.tariff,
            });
        }
        self.closed = true;
        Ok(())
    }

    /// Inquiry view; call after [`Ticket::accrue`]
    pub fn phase(&self, now: DateTime<Utc>) -> TicketPhase {
        if self.is_payment_frozen(now) && !self.closed {
            TicketPhase::PaidFrozen
        } else if self.closed {
            TicketPhase::Closed
        } else if self.tariff == 0 && self.is_within_grace(now) {
            TicketPhase::Free
        } else {
            TicketPhase::Due(self.tariff)
        }
    }

    /// Latest exit time for a paid ticket
    pub fn exit_deadline(&self) -> Option<DateTime<Utc>> {
        self.paid_at.map(|at| at + Duration::minutes(PAID_FREEZE_MINUTES))
    }
}

/// Twelve random digits followed by the location suffix
pub fn generate_transaction_no<R: Rng>(rng: &mut R) -> String {
    let digits: String = (0..12).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
    format!("{digits}{TICKET_SUFFIX}")
}

/// Random alphanumeric reference handed back on payment
pub fn generate_reference_no<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(rng.sample(rand::distributions::Alphanumeric)))
        .collect()
}
