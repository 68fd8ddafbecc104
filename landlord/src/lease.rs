// Core lease data structures

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Wire value asking the landlord to pick a duration.
pub const ANY: i64 = -1;

/// Wire value asking for as long a lease as the landlord will give.
pub const FOREVER: i64 = i64::MAX;

/// Opaque handle identifying a leased resource at its landlord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseCookie(pub Uuid);

impl LeaseCookie {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseCookie {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Duration a lease holder asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestedDuration {
    /// Let the policy choose
    Any,
    /// As long as possible
    Forever,
    Millis(u64),
}

impl RequestedDuration {
    /// Decodes the signed wire representation. Negative values other than
    /// [`ANY`] are rejected.
    pub fn from_wire(raw: i64) -> Result<Self> {
        match raw {
            ANY => Ok(Self::Any),
            FOREVER => Ok(Self::Forever),
            d if d < 0 => Err(Error::InvalidDuration(d)),
            d => Ok(Self::Millis(d.unsigned_abs())),
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Self::Any => ANY,
            Self::Forever => FOREVER,
            Self::Millis(ms) => i64::try_from(ms).unwrap_or(FOREVER),
        }
    }
}

impl From<Duration> for RequestedDuration {
    fn from(duration: Duration) -> Self {
        Self::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A granted lease as seen by its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub cookie: LeaseCookie,

    /// Absolute expiration in milliseconds since the Unix epoch
    pub expiration: u64,
}

impl Lease {
    pub fn new(cookie: LeaseCookie, expiration: u64) -> Self {
        Self { cookie, expiration }
    }

    /// Check if the lease has expired at the given time
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration
    }

    /// Time remaining until expiration
    pub fn time_remaining(&self, now: u64) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            Some(Duration::from_millis(self.expiration - now))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_duration_wire_mapping() {
        assert_eq!(RequestedDuration::from_wire(-1).unwrap(), RequestedDuration::Any);
        assert_eq!(
            RequestedDuration::from_wire(i64::MAX).unwrap(),
            RequestedDuration::Forever
        );
        assert_eq!(
            RequestedDuration::from_wire(5_000).unwrap(),
            RequestedDuration::Millis(5_000)
        );
        assert_eq!(
            RequestedDuration::from_wire(-7),
            Err(Error::InvalidDuration(-7))
        );
        assert_eq!(RequestedDuration::Millis(42).to_wire(), 42);
        assert_eq!(RequestedDuration::Any.to_wire(), ANY);
    }

    #[test]
    fn test_lease_expiration() {
        let lease = Lease::new(LeaseCookie::new(), 31_000);

        assert!(!lease.is_expired(1_000));
        assert!(!lease.is_expired(30_999));
        assert!(lease.is_expired(31_000));
        assert!(lease.is_expired(31_001));
    }

    #[test]
    fn test_time_remaining() {
        let lease = Lease::new(LeaseCookie::new(), 10_000);
        assert_eq!(lease.time_remaining(4_000), Some(Duration::from_millis(6_000)));
        assert_eq!(lease.time_remaining(10_000), None);
    }
}
