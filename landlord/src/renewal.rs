// Lease renewal manager - keeps a holder's leases alive until the holder no
// longer wants them

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseCookie, RequestedDuration};
use crate::registry::Landlord;

/// Default lower bound on how early a renewal is attempted
pub const DEFAULT_RENEWAL_WINDOW: Duration = Duration::from_secs(1);

/// Things a lease holder needs to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalEvent {
    /// The lease could not be renewed and is no longer managed
    Failed { cookie: LeaseCookie, error: Error },
    /// The holder's desired expiration arrived; the lease is no longer managed
    DesiredExpirationReached { cookie: LeaseCookie },
}

#[derive(Debug, Clone)]
struct Managed {
    lease: Lease,
    /// `u64::MAX` means renew for as long as the landlord allows
    desired_expiration: u64,
    renew_duration: RequestedDuration,
    /// Length of the most recent grant
    granted: u64,
}

impl Managed {
    fn renew_at(&self, min_window: u64) -> u64 {
        let window = (self.granted / 2).max(min_window);
        self.lease.expiration.saturating_sub(window)
    }

    fn request(&self, now: u64) -> RequestedDuration {
        if self.desired_expiration == u64::MAX {
            return self.renew_duration;
        }
        let left = self.desired_expiration - now;
        match self.renew_duration {
            RequestedDuration::Millis(ms) => RequestedDuration::Millis(ms.min(left)),
            RequestedDuration::Any | RequestedDuration::Forever => RequestedDuration::Millis(left),
        }
    }
}

/// Renews leases through their landlord ahead of expiry.
///
/// A lease is renewed once half of its last grant has elapsed (but never
/// later than the renewal window before expiry) and is dropped once the
/// holder's desired expiration passes.
pub struct LeaseRenewalManager {
    landlord: Arc<dyn Landlord>,
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<LeaseCookie, Managed>>,
    events: mpsc::UnboundedSender<RenewalEvent>,
    min_window: u64,
}

impl LeaseRenewalManager {
    pub fn new(
        landlord: Arc<dyn Landlord>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<RenewalEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            landlord,
            clock,
            leases: Mutex::new(HashMap::new()),
            events,
            min_window: millis(DEFAULT_RENEWAL_WINDOW),
        };
        (manager, receiver)
    }

    #[must_use]
    pub fn with_renewal_window(mut self, window: Duration) -> Self {
        self.min_window = millis(window);
        self
    }

    /// Manage `lease` until `desired_expiration` (`u64::MAX` for forever).
    pub fn renew_until(&self, lease: Lease, desired_expiration: u64, renew_duration: RequestedDuration) {
        let now = self.clock.now_millis();
        let managed = Managed {
            lease,
            desired_expiration,
            renew_duration,
            granted: lease.expiration.saturating_sub(now),
        };
        self.leases.lock().insert(lease.cookie, managed);
    }

    /// Manage `lease` for `total` from now.
    pub fn renew_for(&self, lease: Lease, total: Duration, renew_duration: RequestedDuration) {
        let desired = self.clock.now_millis().saturating_add(millis(total));
        self.renew_until(lease, desired, renew_duration);
    }

    /// Stop managing a lease without cancelling it
    pub fn remove(&self, cookie: LeaseCookie) -> Option<Lease> {
        self.leases.lock().remove(&cookie).map(|managed| managed.lease)
    }

    /// Stop managing a lease and cancel it at the landlord
    pub async fn cancel(&self, cookie: LeaseCookie) -> Result<()> {
        self.remove(cookie);
        self.landlord.cancel(cookie).await
    }

    /// Current known expiration of a managed lease
    pub fn expiration(&self, cookie: LeaseCookie) -> Option<u64> {
        self.leases.lock().get(&cookie).map(|managed| managed.lease.expiration)
    }

    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.lock().is_empty()
    }

    /// Performs every renewal that is due and returns how many succeeded.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now_millis();

        let due: Vec<(LeaseCookie, RequestedDuration)> = {
            let mut leases = self.leases.lock();
            let reached: Vec<LeaseCookie> = leases
                .iter()
                .filter(|(_, managed)| managed.desired_expiration <= now)
                .map(|(cookie, _)| *cookie)
                .collect();
            for cookie in reached {
                leases.remove(&cookie);
                let _ = self.events.send(RenewalEvent::DesiredExpirationReached { cookie });
            }

            leases
                .iter()
                .filter(|(_, managed)| {
                    managed.lease.expiration < managed.desired_expiration
                        && now >= managed.renew_at(self.min_window)
                })
                .map(|(cookie, managed)| (*cookie, managed.request(now)))
                .collect()
        };
        if due.is_empty() {
            return 0;
        }

        debug!("Renewing {} leases", due.len());
        let results = self.landlord.renew_all(due.clone()).await;

        let mut renewed = 0;
        let mut leases = self.leases.lock();
        for ((cookie, _), result) in due.into_iter().zip(results) {
            let Some(managed) = leases.get_mut(&cookie) else {
                // Removed while the renewal was in flight
                continue;
            };
            match result {
                Ok(granted) => {
                    managed.lease.expiration = granted.expiration;
                    managed.granted = granted.duration;
                    renewed += 1;
                }
                Err(error) if error.is_indefinite() && !managed.lease.is_expired(now) => {
                    warn!("Renewal of {} failed, will retry: {}", cookie, error);
                }
                Err(error) => {
                    warn!("Giving up on lease {}: {}", cookie, error);
                    leases.remove(&cookie);
                    let _ = self.events.send(RenewalEvent::Failed { cookie, error });
                }
            }
        }
        renewed
    }

    /// Runs [`tick`](Self::tick) every `poll` until the returned task is
    /// aborted.
    pub fn spawn(self: Arc<Self>, poll: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
