// Unicast discovery - protocol version and format negotiation, then the
// negotiated format's exchange

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use landlord::Clock;

use crate::constraint::InvocationConstraints;
use crate::error::{Error, Result};
use crate::transport::{Connector, Deadline, DiscoveryStream, Dispatcher};

use super::subject::ClientSubjectChecker;
use super::wire;
use super::{DiscoveryProvider, ProviderRegistry, UnicastResponse, PROTOCOL_VERSION};

/// Most format names a client may offer in one request
const MAX_OFFERED_FORMATS: u16 = 64;

/// Supplies the response a lookup service hands to discovering clients.
pub trait ResponseSource: Send + Sync {
    fn unicast_response(&self) -> Result<UnicastResponse>;
}

/// Client half of unicast discovery.
#[derive(Debug, Clone)]
pub struct UnicastClient {
    registry: Arc<ProviderRegistry>,
    constraints: InvocationConstraints,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
}

impl UnicastClient {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        constraints: InvocationConstraints,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            constraints,
            connector,
            clock,
        }
    }

    pub fn constraints(&self) -> &InvocationConstraints {
        &self.constraints
    }

    /// Connects to a lookup service and runs discovery against it.
    ///
    /// Fails before connecting when no configured format can satisfy the
    /// constraints.
    pub async fn discover(&self, host: &str, port: u16) -> Result<UnicastResponse> {
        let constraints = self.constraints.make_absolute(self.clock.now_millis());
        let offered = self.registry.acceptable(&constraints)?;
        let deadline = Deadline::from_constraints(&constraints, self.clock.as_ref());

        let target = format!("{host}:{port}");
        let mut stream = deadline
            .connect(&target, self.connector.connect(host, port))
            .await?;
        debug!("Connected to {} for unicast discovery", target);

        let response = negotiate_client(stream.as_mut(), &offered, &constraints, &deadline).await;
        let _ = stream.shutdown().await;
        response
    }

    /// Runs the client half over a stream the lookup service opened, as
    /// happens when it answers a multicast request.
    pub async fn discover_over(&self, stream: &mut dyn DiscoveryStream) -> Result<UnicastResponse> {
        let constraints = self.constraints.make_absolute(self.clock.now_millis());
        let offered = self.registry.acceptable(&constraints)?;
        let deadline = Deadline::from_constraints(&constraints, self.clock.as_ref());
        negotiate_client(stream, &offered, &constraints, &deadline).await
    }
}

async fn negotiate_client(
    stream: &mut dyn DiscoveryStream,
    offered: &[DiscoveryProvider],
    constraints: &InvocationConstraints,
    deadline: &Deadline,
) -> Result<UnicastResponse> {
    let names: Vec<String> = offered.iter().map(|p| p.name().to_string()).collect();

    let mut hello = BytesMut::new();
    hello.put_u32(PROTOCOL_VERSION);
    let count = u16::try_from(names.len())
        .ok()
        .filter(|count| *count <= MAX_OFFERED_FORMATS)
        .ok_or_else(|| Error::Config(format!("too many discovery formats ({})", names.len())))?;
    hello.put_u16(count);
    for name in &names {
        wire::put_str(&mut hello, name)?;
    }
    wire::write_all(stream, &hello, deadline).await?;

    let selected = wire::read_str(stream, deadline).await?;
    if selected.is_empty() {
        return Err(Error::FormatRejected { offered: names });
    }
    let provider = offered
        .iter()
        .find(|p| p.name() == selected)
        .ok_or_else(|| Error::malformed(format!("server selected unoffered format {selected:?}")))?;
    debug!("Server selected discovery format {}", selected);

    provider.codec().unicast_client(stream, constraints, deadline).await
}

/// Server half of unicast discovery.
pub struct UnicastServer {
    registry: Arc<ProviderRegistry>,
    constraints: InvocationConstraints,
    subject_checker: Arc<dyn ClientSubjectChecker>,
    source: Arc<dyn ResponseSource>,
    clock: Arc<dyn Clock>,
}

impl UnicastServer {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        constraints: InvocationConstraints,
        subject_checker: Arc<dyn ClientSubjectChecker>,
        source: Arc<dyn ResponseSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            constraints,
            subject_checker,
            source,
            clock,
        }
    }

    pub fn constraints(&self) -> &InvocationConstraints {
        &self.constraints
    }

    /// Time bounds for an exchange starting now
    pub fn deadline(&self) -> Deadline {
        let constraints = self.constraints.make_absolute(self.clock.now_millis());
        Deadline::from_constraints(&constraints, self.clock.as_ref())
    }

    /// Serves one discovery exchange.
    ///
    /// The first format the client offers that this server has and whose
    /// checker accepts the server's constraints is selected. When none
    /// qualifies an empty selection is sent and nothing else; the error is
    /// the first constraint failure, or `FormatRejected` when no offered
    /// format is known here.
    pub async fn handle(&self, stream: &mut dyn DiscoveryStream) -> Result<()> {
        let constraints = self.constraints.make_absolute(self.clock.now_millis());
        let deadline = self.deadline();

        let version = wire::read_u32(stream, &deadline).await?;
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocolVersion(version));
        }
        let count = wire::read_u16(stream, &deadline).await?;
        if count > MAX_OFFERED_FORMATS {
            return Err(Error::malformed(format!("client offered {count} formats")));
        }
        let mut offered = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            offered.push(wire::read_str(stream, &deadline).await?);
        }

        let mut unusable = None;
        let selected = offered.iter().find_map(|name| {
            let provider = self.registry.get(name).ok()?;
            match provider.check_constraints(&constraints) {
                Ok(satisfied) => Some((provider, satisfied)),
                Err(e) => {
                    debug!("Format {} unusable: {}", name, e);
                    unusable.get_or_insert(e);
                    None
                }
            }
        });
        let Some((provider, satisfied)) = selected else {
            let mut reject = BytesMut::new();
            wire::put_str(&mut reject, "")?;
            wire::write_all(stream, &reject, &deadline).await?;
            return Err(unusable.unwrap_or(Error::FormatRejected { offered }));
        };

        let response = self.source.unicast_response()?;
        let mut accept = BytesMut::new();
        wire::put_str(&mut accept, provider.name())?;
        wire::write_all(stream, &accept, &deadline).await?;

        provider
            .codec()
            .unicast_server(stream, &response, &satisfied, self.subject_checker.as_ref(), &deadline)
            .await
    }
}

#[async_trait]
impl Dispatcher for UnicastServer {
    async fn dispatch(&self, mut stream: Box<dyn DiscoveryStream>, peer: SocketAddr) {
        match self.handle(stream.as_mut()).await {
            Ok(()) => info!("Served unicast discovery to {}", peer),
            Err(e) => warn!("Unicast discovery with {} failed: {}", peer, e),
        }
        let _ = stream.shutdown().await;
    }

    fn admission_timeout(&self) -> Option<Duration> {
        self.deadline().io_timeout()
    }
}
