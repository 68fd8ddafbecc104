// Landlord resource registry - grant, renewal, cancellation and expiry of
// leased resources keyed by cookie

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry as KeyEntry, DashMap};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseCookie, RequestedDuration};
use crate::policy::{LeasePeriodPolicy, PolicyResult};

/// Something a landlord hands out leases on.
pub trait LeasedResource: Send + 'static {
    fn cookie(&self) -> LeaseCookie;

    /// Absolute expiration in milliseconds since the Unix epoch
    fn expiration(&self) -> u64;

    fn set_expiration(&mut self, expiration: u64);
}

/// Current status of a registered lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Lease is active and valid
    Active,
    /// Clock has passed the expiration
    Expired,
    /// Released by its holder
    Cancelled,
}

/// The remote lease surface a lease holder talks to.
#[async_trait]
pub trait Landlord: Send + Sync {
    async fn renew(&self, cookie: LeaseCookie, duration: RequestedDuration) -> Result<PolicyResult>;

    async fn cancel(&self, cookie: LeaseCookie) -> Result<()>;

    /// One result per request, in request order.
    async fn renew_all(
        &self,
        requests: Vec<(LeaseCookie, RequestedDuration)>,
    ) -> Vec<Result<PolicyResult>>;

    async fn cancel_all(&self, cookies: Vec<LeaseCookie>) -> Result<()>;
}

struct Slot<R> {
    resource: R,
    status: LeaseStatus,
    /// Logical registration key, for idempotent grants
    key: Option<Uuid>,
}

type SharedSlot<R> = Arc<Mutex<Slot<R>>>;

/// Tracks leased resources for a landlord.
///
/// Every transition of a single lease happens under that lease's own mutex,
/// so renew, cancel and the expiration sweep are linearizable per lease
/// while distinct leases never contend on a common lock.
pub struct LeaseRegistry<R> {
    entries: DashMap<LeaseCookie, SharedSlot<R>>,
    keys: DashMap<Uuid, LeaseCookie>,
    policy: Arc<dyn LeasePeriodPolicy>,
    clock: Arc<dyn Clock>,
}

impl<R: LeasedResource> LeaseRegistry<R> {
    pub fn new(policy: Arc<dyn LeasePeriodPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            keys: DashMap::new(),
            policy,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Grant a lease on a new resource
    pub fn grant(&self, resource: R, requested: RequestedDuration) -> Result<Lease> {
        self.insert(resource, requested, None)
    }

    /// Grant a lease on the resource registered under `key`.
    ///
    /// If a live lease already exists for `key`, no resource is created: the
    /// existing lease is granted again from the current time and its cookie
    /// is returned, so a retried registration is indistinguishable from one
    /// that succeeded the first time.
    pub fn grant_keyed<F>(&self, key: Uuid, requested: RequestedDuration, make: F) -> Result<Lease>
    where
        F: FnOnce() -> R,
    {
        self.grant_keyed_with(key, requested, make, |_| {})
    }

    /// Like [`grant_keyed`](Self::grant_keyed), but a live resource is first
    /// passed to `update` under the same lock that re-grants its lease.
    pub fn grant_keyed_with<F, U>(
        &self,
        key: Uuid,
        requested: RequestedDuration,
        make: F,
        update: U,
    ) -> Result<Lease>
    where
        F: FnOnce() -> R,
        U: FnOnce(&mut R),
    {
        match self.keys.entry(key) {
            KeyEntry::Occupied(mut occupied) => {
                let cookie = *occupied.get();
                if let Some(slot) = self.slot(&cookie) {
                    let mut entry = slot.lock();
                    let now = self.clock.now_millis();
                    if entry.status == LeaseStatus::Active && entry.resource.expiration() > now {
                        let result = self.policy.grant(&entry.resource, requested)?;
                        update(&mut entry.resource);
                        entry.resource.set_expiration(result.expiration);
                        debug!("Re-granted keyed lease {} for {}", cookie, key);
                        return Ok(Lease::new(cookie, result.expiration));
                    }
                    entry.status = LeaseStatus::Expired;
                }
                // The mapping points at a dead lease; replace it.
                self.entries.remove(&cookie);
                let lease = self.insert(make(), requested, Some(key))?;
                occupied.insert(lease.cookie);
                Ok(lease)
            }
            KeyEntry::Vacant(vacant) => {
                let lease = self.insert(make(), requested, Some(key))?;
                vacant.insert(lease.cookie);
                Ok(lease)
            }
        }
    }

    fn insert(&self, mut resource: R, requested: RequestedDuration, key: Option<Uuid>) -> Result<Lease> {
        let result = self.policy.grant(&resource, requested)?;
        resource.set_expiration(result.expiration);
        let cookie = resource.cookie();

        self.entries.insert(
            cookie,
            Arc::new(Mutex::new(Slot {
                resource,
                status: LeaseStatus::Active,
                key,
            })),
        );
        debug!("Granted lease {} for {}ms", cookie, result.duration);
        Ok(Lease::new(cookie, result.expiration))
    }

    fn slot(&self, cookie: &LeaseCookie) -> Option<SharedSlot<R>> {
        self.entries.get(cookie).map(|entry| Arc::clone(entry.value()))
    }

    fn evict(&self, cookie: LeaseCookie, key: Option<Uuid>) {
        self.entries.remove(&cookie);
        if let Some(key) = key {
            self.keys.remove_if(&key, |_, current| *current == cookie);
        }
    }

    /// Renew an existing lease
    pub fn renew(&self, cookie: LeaseCookie, requested: RequestedDuration) -> Result<PolicyResult> {
        let slot = self.slot(&cookie).ok_or(Error::UnknownLease { cookie })?;
        let mut entry = slot.lock();
        if entry.status != LeaseStatus::Active {
            return Err(Error::UnknownLease { cookie });
        }
        if entry.resource.expiration() <= self.clock.now_millis() {
            entry.status = LeaseStatus::Expired;
            let key = entry.key;
            drop(entry);
            self.evict(cookie, key);
            return Err(Error::UnknownLease { cookie });
        }

        let result = self.policy.renew(&entry.resource, requested)?;
        entry.resource.set_expiration(result.expiration);
        debug!("Renewed lease {} until {}", cookie, result.expiration);
        Ok(result)
    }

    /// Release a lease early
    pub fn cancel(&self, cookie: LeaseCookie) -> Result<()> {
        let slot = self.slot(&cookie).ok_or(Error::UnknownLease { cookie })?;
        let mut entry = slot.lock();
        if entry.status != LeaseStatus::Active {
            return Err(Error::UnknownLease { cookie });
        }
        let expired = entry.resource.expiration() <= self.clock.now_millis();
        entry.status = if expired {
            LeaseStatus::Expired
        } else {
            LeaseStatus::Cancelled
        };
        let key = entry.key;
        drop(entry);

        self.evict(cookie, key);
        if expired {
            Err(Error::UnknownLease { cookie })
        } else {
            info!("Cancelled lease {}", cookie);
            Ok(())
        }
    }

    pub fn renew_all(&self, requests: &[(LeaseCookie, RequestedDuration)]) -> Vec<Result<PolicyResult>> {
        requests
            .iter()
            .map(|(cookie, requested)| self.renew(*cookie, *requested))
            .collect()
    }

    /// Cancels every lease it can; the error lists the ones it could not.
    pub fn cancel_all(&self, cookies: &[LeaseCookie]) -> Result<()> {
        let failed: Vec<(LeaseCookie, Error)> = cookies
            .iter()
            .filter_map(|cookie| self.cancel(*cookie).err().map(|e| (*cookie, e)))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::CancelAll {
                attempted: cookies.len(),
                failed,
            })
        }
    }

    /// Read access to a live resource
    pub fn with_resource<T>(&self, cookie: LeaseCookie, f: impl FnOnce(&R) -> T) -> Result<T> {
        self.with_resource_mut(cookie, |resource| f(resource))
    }

    pub fn with_resource_mut<T>(&self, cookie: LeaseCookie, f: impl FnOnce(&mut R) -> T) -> Result<T> {
        let slot = self.slot(&cookie).ok_or(Error::UnknownLease { cookie })?;
        let mut entry = slot.lock();
        if entry.status != LeaseStatus::Active
            || entry.resource.expiration() <= self.clock.now_millis()
        {
            return Err(Error::UnknownLease { cookie });
        }
        Ok(f(&mut entry.resource))
    }

    /// Status of a lease still held by the registry. Leases that were
    /// cancelled or swept are gone and report `None`.
    pub fn status(&self, cookie: LeaseCookie) -> Option<LeaseStatus> {
        let slot = self.slot(&cookie)?;
        let entry = slot.lock();
        if entry.status == LeaseStatus::Active
            && entry.resource.expiration() <= self.clock.now_millis()
        {
            Some(LeaseStatus::Expired)
        } else {
            Some(entry.status)
        }
    }

    /// Look up the cookie registered under a logical key
    pub fn cookie_for(&self, key: &Uuid) -> Option<LeaseCookie> {
        self.keys.get(key).map(|cookie| *cookie)
    }

    /// Cookies of all leases that are live right now
    pub fn live_cookies(&self) -> Vec<LeaseCookie> {
        let now = self.clock.now_millis();
        self.snapshot()
            .into_iter()
            .filter(|(_, slot)| {
                let entry = slot.lock();
                entry.status == LeaseStatus::Active && entry.resource.expiration() > now
            })
            .map(|(cookie, _)| cookie)
            .collect()
    }

    /// Removes every lease whose expiration has passed.
    ///
    /// Each candidate is re-checked under its own lock, so a renewal that
    /// committed before the sweep reached it keeps the lease alive.
    pub fn sweep(&self) -> Vec<LeaseCookie> {
        let now = self.clock.now_millis();
        let mut expired = Vec::new();

        for (cookie, slot) in self.snapshot() {
            let mut entry = slot.lock();
            if entry.status != LeaseStatus::Active || entry.resource.expiration() > now {
                continue;
            }
            entry.status = LeaseStatus::Expired;
            let key = entry.key;
            drop(entry);

            self.evict(cookie, key);
            expired.push(cookie);
        }

        if !expired.is_empty() {
            info!("Expired {} leases", expired.len());
        }
        expired
    }

    fn snapshot(&self) -> Vec<(LeaseCookie, SharedSlot<R>)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<R> fmt::Debug for LeaseRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseRegistry")
            .field("leases", &self.entries.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<R: LeasedResource> Landlord for LeaseRegistry<R> {
    async fn renew(&self, cookie: LeaseCookie, duration: RequestedDuration) -> Result<PolicyResult> {
        LeaseRegistry::renew(self, cookie, duration)
    }

    async fn cancel(&self, cookie: LeaseCookie) -> Result<()> {
        LeaseRegistry::cancel(self, cookie)
    }

    async fn renew_all(
        &self,
        requests: Vec<(LeaseCookie, RequestedDuration)>,
    ) -> Vec<Result<PolicyResult>> {
        LeaseRegistry::renew_all(self, &requests)
    }

    async fn cancel_all(&self, cookies: Vec<LeaseCookie>) -> Result<()> {
        LeaseRegistry::cancel_all(self, &cookies)
    }
}
