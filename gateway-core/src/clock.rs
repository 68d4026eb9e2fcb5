//! Time source abstraction.
//!
//! Key rotation, tariff accrual and breaker cooldowns all depend on "now";
//! they take a [`Clock`] so tests can pin or advance time.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use parking_lot::Mutex;

/// Wire format for local timestamps (`YYYY-MM-DD HH:mm:ss`)
pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Offset of the locations' wall clock (WIB, UTC+7)
const LOCAL_OFFSET_SECS: i32 = 7 * 3600;

/// Source of the current instant
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(LOCAL_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Format an instant as location wall-clock time
pub fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&local_offset()).format(LOCAL_FORMAT).to_string()
}

/// Parse a location wall-clock timestamp
pub fn parse_local(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, LOCAL_FORMAT).ok()?;
    local_offset()
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
