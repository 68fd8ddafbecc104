// Discovery - message types, the format provider registry and the
// multicast/unicast protocol layers built on top of it

pub mod locator;
pub mod multicast;
pub mod plaintext;
pub mod signed;
pub mod subject;
pub mod unicast;
pub mod wire;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

use crate::constraint::{ConstraintChecker, InvocationConstraints};
use crate::error::{Error, Result};
use crate::registrar::RegistrarProxy;
use crate::transport::{Deadline, DiscoveryStream};

use self::multicast::Datagram;
use self::subject::ClientSubjectChecker;

pub const PROTOCOL_VERSION: u32 = 2;
pub const DEFAULT_PORT: u16 = 4160;
pub const REQUEST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 85);
pub const ANNOUNCEMENT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 84);
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;
/// Smallest packet size a multicast constraint may ask for
pub const MIN_PACKET_SIZE: u32 = 128;
pub const DEFAULT_TTL: u32 = 15;
/// The public group
pub const PUBLIC_GROUP: &str = "";

/// Sent by a client looking for lookup services.
///
/// An empty group list asks for lookup services of every group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastRequest {
    pub host: String,
    pub port: u16,
    pub groups: Vec<String>,
    /// Lookup services the client already knows and does not want to hear
    /// from again
    pub heard_from: Vec<Uuid>,
}

impl MulticastRequest {
    /// Whether a lookup service in `groups` should answer.
    pub fn wants_any_of(&self, groups: &[String]) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| groups.contains(g))
    }
}

/// Periodically sent by a lookup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastAnnouncement {
    pub sequence: u64,
    pub host: String,
    pub port: u16,
    pub registrar_id: Uuid,
    pub groups: Vec<String>,
}

/// What a lookup service hands back at the end of unicast discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastResponse {
    pub host: String,
    pub port: u16,
    pub groups: Vec<String>,
    /// Serialized registrar proxy
    pub registrar: Bytes,
}

impl UnicastResponse {
    pub fn registrar_proxy(&self) -> Result<RegistrarProxy> {
        RegistrarProxy::from_bytes(&self.registrar)
    }
}

/// Produces datagrams for multicast encoding. Each new datagram already
/// carries the packet header; codecs append their payload.
pub trait DatagramBufferFactory {
    fn new_datagram(&mut self) -> &mut BytesMut;

    /// Largest datagram, header included
    fn max_datagram_size(&self) -> usize;
}

/// Called on each datagram once its payload is complete.
pub type SealFn<'a> = &'a mut dyn FnMut(&mut BytesMut) -> Result<()>;

/// Wire codec for one discovery format.
#[async_trait]
pub trait DiscoveryCodec: Send + Sync + fmt::Debug {
    fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        buffers: &mut dyn DatagramBufferFactory,
        constraints: &InvocationConstraints,
    ) -> Result<()>;

    fn decode_multicast_request(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
        subject_checker: &dyn ClientSubjectChecker,
    ) -> Result<MulticastRequest>;

    fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        buffers: &mut dyn DatagramBufferFactory,
        constraints: &InvocationConstraints,
    ) -> Result<()>;

    fn decode_multicast_announcement(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
    ) -> Result<MulticastAnnouncement>;

    /// Client half of the format-specific unicast exchange, run after the
    /// format has been negotiated.
    async fn unicast_client(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &InvocationConstraints,
        deadline: &Deadline,
    ) -> Result<UnicastResponse>;

    /// Server half of the format-specific unicast exchange.
    async fn unicast_server(
        &self,
        stream: &mut dyn DiscoveryStream,
        response: &UnicastResponse,
        constraints: &InvocationConstraints,
        subject_checker: &dyn ClientSubjectChecker,
        deadline: &Deadline,
    ) -> Result<()>;
}

/// A named wire format: its codec and the checker for what it can enforce.
#[derive(Debug, Clone)]
pub struct DiscoveryProvider {
    name: String,
    checker: Arc<dyn ConstraintChecker>,
    codec: Arc<dyn DiscoveryCodec>,
}

impl DiscoveryProvider {
    pub fn new(checker: Arc<dyn ConstraintChecker>, codec: Arc<dyn DiscoveryCodec>) -> Self {
        Self {
            name: checker.format_name().to_string(),
            checker,
            codec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &dyn DiscoveryCodec {
        self.codec.as_ref()
    }

    pub fn check_constraints(&self, constraints: &InvocationConstraints) -> Result<InvocationConstraints> {
        self.checker.check_constraints(constraints)
    }
}

/// Format name to provider. Populated once at startup and read-only after.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, DiscoveryProvider>,
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider; later registrations of the same name replace
    /// earlier ones but keep their preference position.
    #[must_use]
    pub fn with(mut self, provider: DiscoveryProvider) -> Self {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_none() {
            self.order.push(name);
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<&DiscoveryProvider> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::UnknownFormat(name.to_string()))
    }

    /// Providers in preference order
    pub fn providers(&self) -> impl Iterator<Item = &DiscoveryProvider> {
        self.order.iter().filter_map(|name| self.providers.get(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Providers able to satisfy `constraints`, in preference order.
    ///
    /// Fails with the first provider's error when none qualifies.
    pub fn acceptable(&self, constraints: &InvocationConstraints) -> Result<Vec<DiscoveryProvider>> {
        let mut first_error = None;
        let mut acceptable = Vec::new();
        for provider in self.providers() {
            match provider.check_constraints(constraints) {
                Ok(_) => acceptable.push(provider.clone()),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if acceptable.is_empty() {
            return Err(first_error.unwrap_or_else(|| Error::Config("no discovery formats configured".into())));
        }
        Ok(acceptable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Constraint;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with(plaintext::provider())
            .with(signed::provider(signed::SignedFormat::new(
                Some(signed::generate_identity()),
                [],
            )))
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(plaintext::FORMAT_NAME).unwrap().name(), plaintext::FORMAT_NAME);
        assert!(matches!(registry.get("net.jini.discovery.x500"), Err(Error::UnknownFormat(_))));
    }

    #[test]
    fn test_acceptable_filters_by_constraints() {
        let registry = registry();

        let any = registry.acceptable(&InvocationConstraints::empty()).unwrap();
        assert_eq!(any.len(), 2);

        let integrity = InvocationConstraints::requiring([Constraint::Integrity(true)]).unwrap();
        let names: Vec<String> = registry
            .acceptable(&integrity)
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec![signed::FORMAT_NAME.to_string()]);

        let secret = InvocationConstraints::requiring([Constraint::Confidentiality(true)]).unwrap();
        assert!(matches!(
            registry.acceptable(&secret),
            Err(Error::UnsupportedConstraint { .. })
        ));
    }

    #[test]
    fn test_request_group_matching() {
        let request = MulticastRequest {
            host: "client".into(),
            port: 5000,
            groups: vec!["prod".into()],
            heard_from: vec![],
        };
        assert!(request.wants_any_of(&["prod".into(), "dev".into()]));
        assert!(!request.wants_any_of(&[PUBLIC_GROUP.into()]));

        let everything = MulticastRequest { groups: vec![], ..request };
        assert!(everything.wants_any_of(&["anything".into()]));
    }
}
