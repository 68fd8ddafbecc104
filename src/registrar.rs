// Lookup service registrar - leased service registrations handed out to
// discovering clients

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use landlord::{
    Clock, Landlord, Lease, LeaseCookie, LeasePeriodPolicy, LeaseRegistry, LeasedResource,
    RequestedDuration,
};

use crate::discovery::unicast::ResponseSource;
use crate::discovery::UnicastResponse;
use crate::error::Result;

/// What a client receives to talk to a lookup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrarProxy {
    pub registrar_id: Uuid,
    pub host: String,
    pub port: u16,
    pub groups: Vec<String>,
}

impl RegistrarProxy {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    /// Nil asks the registrar to assign one
    pub service_id: Uuid,
    pub attributes: BTreeMap<String, String>,
    /// Opaque service proxy
    pub proxy: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub service_id: Uuid,
    pub lease: Lease,
}

pub struct ServiceRecord {
    cookie: LeaseCookie,
    expiration: u64,
    item: ServiceItem,
}

impl LeasedResource for ServiceRecord {
    fn cookie(&self) -> LeaseCookie {
        self.cookie
    }

    fn expiration(&self) -> u64 {
        self.expiration
    }

    fn set_expiration(&mut self, expiration: u64) {
        self.expiration = expiration;
    }
}

/// A lookup service: registers leased service items and describes itself
/// to discovering clients.
pub struct LookupService {
    proxy: RegistrarProxy,
    leases: Arc<LeaseRegistry<ServiceRecord>>,
}

impl LookupService {
    pub fn new(proxy: RegistrarProxy, policy: Arc<dyn LeasePeriodPolicy>, clock: Arc<dyn Clock>) -> Self {
        info!("Lookup service {} for groups {:?}", proxy.registrar_id, proxy.groups);
        Self {
            proxy,
            leases: Arc::new(LeaseRegistry::new(policy, clock)),
        }
    }

    pub fn proxy(&self) -> &RegistrarProxy {
        &self.proxy
    }

    pub fn leases(&self) -> &Arc<LeaseRegistry<ServiceRecord>> {
        &self.leases
    }

    /// The remote lease surface for registrations
    pub fn landlord(&self) -> Arc<dyn Landlord> {
        self.leases.clone()
    }

    /// Registers `item` under a lease.
    ///
    /// Registering an id that already holds a live lease returns that
    /// lease and replaces the stored item. A nil id is replaced by one
    /// derived from the item's content, so a retried registration lands
    /// on the same lease.
    pub fn register(&self, mut item: ServiceItem, requested: RequestedDuration) -> Result<ServiceRegistration> {
        if item.service_id.is_nil() {
            item.service_id = content_id(&item)?;
        }
        let service_id = item.service_id;

        let stored = item.clone();
        let lease = self.leases.grant_keyed_with(
            service_id,
            requested,
            move || ServiceRecord {
                cookie: LeaseCookie::new(),
                expiration: 0,
                item: stored,
            },
            |record| record.item = item,
        )?;
        debug!("Registered service {} until {}", service_id, lease.expiration);

        Ok(ServiceRegistration { service_id, lease })
    }

    pub fn lookup(&self, service_id: &Uuid) -> Option<ServiceItem> {
        let cookie = self.leases.cookie_for(service_id)?;
        self.leases
            .with_resource(cookie, |record| record.item.clone())
            .ok()
    }

    /// Live items carrying every given attribute
    pub fn lookup_matching(&self, attributes: &BTreeMap<String, String>) -> Vec<ServiceItem> {
        self.leases
            .live_cookies()
            .into_iter()
            .filter_map(|cookie| {
                self.leases
                    .with_resource(cookie, |record| {
                        attributes
                            .iter()
                            .all(|(k, v)| record.item.attributes.get(k) == Some(v))
                            .then(|| record.item.clone())
                    })
                    .ok()
                    .flatten()
            })
            .collect()
    }
}

fn content_id(item: &ServiceItem) -> Result<Uuid> {
    let encoded = bincode::serialize(&(&item.attributes, &item.proxy))?;
    let digest = blake3::hash(&encoded);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
}

impl ResponseSource for LookupService {
    fn unicast_response(&self) -> Result<UnicastResponse> {
        Ok(UnicastResponse {
            host: self.proxy.host.clone(),
            port: self.proxy.port,
            groups: self.proxy.groups.clone(),
            registrar: self.proxy.to_bytes()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use landlord::{FixedLeasePeriodPolicy, ManualClock};
    use std::time::Duration;

    fn service(clock: Arc<ManualClock>) -> LookupService {
        let policy = FixedLeasePeriodPolicy::new(
            Duration::ZERO,
            Duration::from_secs(300),
            Duration::from_secs(600),
            clock.clone(),
        );
        LookupService::new(
            RegistrarProxy {
                registrar_id: Uuid::new_v4(),
                host: "lookup.example".into(),
                port: 4160,
                groups: vec!["".into()],
            },
            Arc::new(policy),
            clock,
        )
    }

    fn item(id: Uuid, colour: &str) -> ServiceItem {
        ServiceItem {
            service_id: id,
            attributes: BTreeMap::from([("colour".to_string(), colour.to_string())]),
            proxy: b"printer".to_vec(),
        }
    }

    #[test]
    fn test_register_is_idempotent_by_id() {
        let service = service(Arc::new(ManualClock::new(1_000)));
        let id = Uuid::new_v4();

        let first = service.register(item(id, "red"), RequestedDuration::Any).unwrap();
        let second = service.register(item(id, "blue"), RequestedDuration::Any).unwrap();

        assert_eq!(first.lease.cookie, second.lease.cookie);
        assert_eq!(service.leases().len(), 1);
        assert_eq!(service.lookup(&id).unwrap().attributes["colour"], "blue");
    }

    #[test]
    fn test_nil_id_assigned() {
        let service = service(Arc::new(ManualClock::new(0)));
        let registration = service.register(item(Uuid::nil(), "red"), RequestedDuration::Any).unwrap();
        assert!(!registration.service_id.is_nil());
        assert!(service.lookup(&registration.service_id).is_some());
    }

    #[test]
    fn test_nil_id_retry_lands_on_same_lease() {
        let service = service(Arc::new(ManualClock::new(0)));

        let first = service.register(item(Uuid::nil(), "red"), RequestedDuration::Any).unwrap();
        let retry = service.register(item(Uuid::nil(), "red"), RequestedDuration::Any).unwrap();
        let other = service.register(item(Uuid::nil(), "blue"), RequestedDuration::Any).unwrap();

        assert_eq!(first.service_id, retry.service_id);
        assert_eq!(first.lease.cookie, retry.lease.cookie);
        assert_ne!(first.service_id, other.service_id);
        assert_eq!(service.leases().len(), 2);
    }

    #[test]
    fn test_reregister_after_expiry_stores_new_item() {
        let clock = Arc::new(ManualClock::new(0));
        let service = service(clock.clone());
        let id = Uuid::new_v4();

        let first = service.register(item(id, "red"), RequestedDuration::Millis(1_000)).unwrap();
        clock.set(1_000);
        let second = service.register(item(id, "blue"), RequestedDuration::Millis(1_000)).unwrap();

        assert_ne!(first.lease.cookie, second.lease.cookie);
        assert_eq!(service.lookup(&id).unwrap().attributes["colour"], "blue");
    }

    #[test]
    fn test_expired_registration_disappears() {
        let clock = Arc::new(ManualClock::new(0));
        let service = service(clock.clone());
        let id = Uuid::new_v4();
        service.register(item(id, "red"), RequestedDuration::Millis(1_000)).unwrap();

        clock.set(1_000);
        assert!(service.lookup(&id).is_none());
        assert!(service.lookup_matching(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_lookup_matching_attributes() {
        let service = service(Arc::new(ManualClock::new(0)));
        service.register(item(Uuid::new_v4(), "red"), RequestedDuration::Any).unwrap();
        service.register(item(Uuid::new_v4(), "blue"), RequestedDuration::Any).unwrap();

        let wanted = BTreeMap::from([("colour".to_string(), "red".to_string())]);
        let found = service.lookup_matching(&wanted);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attributes["colour"], "red");
    }

    #[test]
    fn test_response_carries_proxy() {
        let service = service(Arc::new(ManualClock::new(0)));
        let response = service.unicast_response().unwrap();
        assert_eq!(response.registrar_proxy().unwrap(), *service.proxy());
    }

    #[tokio::test]
    async fn test_cancel_through_landlord() {
        let service = service(Arc::new(ManualClock::new(0)));
        let id = Uuid::new_v4();
        let registration = service.register(item(id, "red"), RequestedDuration::Any).unwrap();

        service.landlord().cancel(registration.lease.cookie).await.unwrap();
        assert!(service.lookup(&id).is_none());
    }
}
