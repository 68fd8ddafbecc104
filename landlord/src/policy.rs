// Lease period policies - decide how long a grant or renewal lasts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lease::RequestedDuration;
use crate::registry::LeasedResource;

/// Outcome of a grant or renewal.
///
/// `expiration` is always the clock reading at decision time plus
/// `duration`, saturated at `u64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub expiration: u64,
    pub duration: u64,
}

/// Decides lease periods for a landlord.
///
/// Implementations must be deterministic: the same clock reading, request
/// and bounds always give the same result.
pub trait LeasePeriodPolicy: Send + Sync + fmt::Debug {
    fn grant(&self, resource: &dyn LeasedResource, requested: RequestedDuration)
        -> Result<PolicyResult>;

    /// Renewals are measured from the current time, never from the
    /// resource's previous expiration.
    fn renew(&self, resource: &dyn LeasedResource, requested: RequestedDuration)
        -> Result<PolicyResult>;
}

/// Grants clamped to fixed `[minimum, maximum]` bounds, with a default used
/// for [`RequestedDuration::Any`].
#[derive(Debug, Clone)]
pub struct FixedLeasePeriodPolicy {
    minimum: u64,
    default: u64,
    maximum: u64,
    clock: Arc<dyn Clock>,
}

impl FixedLeasePeriodPolicy {
    /// The default is pulled into `[minimum, maximum]`, and a maximum below
    /// the minimum is raised to it.
    pub fn new(minimum: Duration, default: Duration, maximum: Duration, clock: Arc<dyn Clock>) -> Self {
        let minimum = millis(minimum);
        let maximum = millis(maximum).max(minimum);
        Self {
            minimum,
            default: millis(default).clamp(minimum, maximum),
            maximum,
            clock,
        }
    }

    pub fn maximum(&self) -> Duration {
        Duration::from_millis(self.maximum)
    }

    fn compute(&self, requested: RequestedDuration) -> Result<PolicyResult> {
        let duration = match requested {
            RequestedDuration::Any => self.default,
            RequestedDuration::Forever => self.maximum,
            RequestedDuration::Millis(ms) => ms.clamp(self.minimum, self.maximum),
        };
        if duration == 0 {
            return Err(Error::LeaseDenied {
                requested: requested.to_wire(),
                reason: "granted duration would be zero".to_string(),
            });
        }

        let now = self.clock.now_millis();
        let expiration = now.saturating_add(duration);
        Ok(PolicyResult {
            expiration,
            duration: expiration - now,
        })
    }
}

impl LeasePeriodPolicy for FixedLeasePeriodPolicy {
    fn grant(&self, _resource: &dyn LeasedResource, requested: RequestedDuration) -> Result<PolicyResult> {
        self.compute(requested)
    }

    fn renew(&self, _resource: &dyn LeasedResource, requested: RequestedDuration) -> Result<PolicyResult> {
        self.compute(requested)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
