// Multicast discovery - datagram framing plus the announcer, request
// responder, announcement listener and request sender tasks

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::constraint::InvocationConstraints;
use crate::error::{Error, Result};
use crate::executor::WorkerPool;
use crate::transport::{Connector, DiscoveryStream, Dispatcher, ListenCookie, Listener};

use super::subject::ClientSubjectChecker;
use super::unicast::{UnicastClient, UnicastServer};
use super::wire;
use super::{
    DatagramBufferFactory, DiscoveryProvider, MulticastAnnouncement, MulticastRequest, ProviderRegistry,
    UnicastResponse, DEFAULT_MAX_PACKET_SIZE, PROTOCOL_VERSION,
};

/// Largest UDP payload we ever read
const RECEIVE_BUFFER: usize = 65_536;
/// How long a silent registrar stays tracked by an announcement listener
const DEFAULT_RETENTION: Duration = Duration::from_secs(20 * 60);

/// A received multicast packet with its header parsed.
#[derive(Debug, Clone)]
pub struct Datagram {
    format: String,
    bytes: Bytes,
    header_len: usize,
}

impl Datagram {
    pub fn parse(bytes: Bytes) -> Result<Self> {
        let mut cursor = bytes.clone();
        let version = wire::get_u32(&mut cursor, "protocol version")?;
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocolVersion(version));
        }
        let format = wire::get_str(&mut cursor, "format name")?;
        let header_len = bytes.len() - cursor.len();
        Ok(Self {
            format,
            bytes,
            header_len,
        })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// The whole datagram, header included
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload(&self) -> Bytes {
        self.bytes.slice(self.header_len..)
    }
}

/// Datagram factory for one format, capped at a maximum size.
#[derive(Debug)]
pub struct DatagramBuffers {
    header: Bytes,
    max: usize,
    datagrams: Vec<BytesMut>,
}

impl DatagramBuffers {
    pub fn new(format: &str, max: usize) -> Result<Self> {
        let mut header = BytesMut::new();
        header.put_u32(PROTOCOL_VERSION);
        wire::put_str(&mut header, format)?;
        Ok(Self {
            header: header.freeze(),
            max,
            datagrams: Vec::new(),
        })
    }

    pub fn into_datagrams(self) -> Vec<Bytes> {
        self.datagrams.into_iter().map(BytesMut::freeze).collect()
    }
}

impl DatagramBufferFactory for DatagramBuffers {
    fn new_datagram(&mut self) -> &mut BytesMut {
        let mut datagram = BytesMut::with_capacity(self.max);
        datagram.put_slice(&self.header);
        self.datagrams.push(datagram);
        let last = self.datagrams.len() - 1;
        &mut self.datagrams[last]
    }

    fn max_datagram_size(&self) -> usize {
        self.max
    }
}

fn packet_limit(constraints: &InvocationConstraints) -> usize {
    constraints.max_packet_size().unwrap_or(DEFAULT_MAX_PACKET_SIZE)
}

pub fn encode_request(
    provider: &DiscoveryProvider,
    request: &MulticastRequest,
    constraints: &InvocationConstraints,
) -> Result<Vec<Bytes>> {
    let satisfied = provider.check_constraints(constraints)?;
    let mut buffers = DatagramBuffers::new(provider.name(), packet_limit(&satisfied))?;
    provider
        .codec()
        .encode_multicast_request(request, &mut buffers, &satisfied)?;
    Ok(buffers.into_datagrams())
}

pub fn encode_announcement(
    provider: &DiscoveryProvider,
    announcement: &MulticastAnnouncement,
    constraints: &InvocationConstraints,
) -> Result<Vec<Bytes>> {
    let satisfied = provider.check_constraints(constraints)?;
    let mut buffers = DatagramBuffers::new(provider.name(), packet_limit(&satisfied))?;
    provider
        .codec()
        .encode_multicast_announcement(announcement, &mut buffers, &satisfied)?;
    Ok(buffers.into_datagrams())
}

pub fn decode_request(
    registry: &ProviderRegistry,
    bytes: Bytes,
    constraints: &InvocationConstraints,
    subject_checker: &dyn ClientSubjectChecker,
) -> Result<MulticastRequest> {
    let datagram = Datagram::parse(bytes)?;
    let provider = registry.get(datagram.format())?;
    let satisfied = provider.check_constraints(constraints)?;
    provider
        .codec()
        .decode_multicast_request(&datagram, &satisfied, subject_checker)
}

pub fn decode_announcement(
    registry: &ProviderRegistry,
    bytes: Bytes,
    constraints: &InvocationConstraints,
) -> Result<MulticastAnnouncement> {
    let datagram = Datagram::parse(bytes)?;
    let provider = registry.get(datagram.format())?;
    let satisfied = provider.check_constraints(constraints)?;
    provider
        .codec()
        .decode_multicast_announcement(&datagram, &satisfied)
}

/// Binds a socket on the group's port and joins the group.
pub async fn bind_group(group: SocketAddrV4) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()))
        .await
        .map_err(|e| Error::transport(format!("bind multicast port {}", group.port()), e))?;
    socket
        .join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)
        .map_err(|e| Error::transport(format!("join group {}", group.ip()), e))?;
    Ok(socket)
}

/// Binds an ephemeral socket for sending with the given time-to-live.
pub async fn bind_sender(ttl: u32) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| Error::transport("bind multicast sender", e))?;
    socket
        .set_multicast_ttl_v4(ttl)
        .map_err(|e| Error::transport("set multicast ttl", e))?;
    Ok(socket)
}

async fn send_all(socket: &UdpSocket, target: SocketAddr, datagrams: &[Bytes]) -> usize {
    let mut sent = 0;
    for datagram in datagrams {
        match socket.send_to(datagram, target).await {
            Ok(_) => sent += 1,
            Err(e) => warn!("Multicast send to {} failed: {}", target, e),
        }
    }
    sent
}

/// Periodically announces a lookup service in every configured format.
pub struct MulticastAnnouncer {
    registry: Arc<ProviderRegistry>,
    constraints: InvocationConstraints,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    template: MulticastAnnouncement,
    sequence: AtomicU64,
}

impl MulticastAnnouncer {
    /// Announcements start at `template.sequence` and count up.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        constraints: InvocationConstraints,
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        template: MulticastAnnouncement,
    ) -> Self {
        let sequence = AtomicU64::new(template.sequence);
        Self {
            registry,
            constraints,
            socket,
            target,
            template,
            sequence,
        }
    }

    /// Sends one announcement round and returns the number of datagrams
    /// sent. Failures are logged; the next round tries again.
    pub async fn announce_once(&self) -> usize {
        let announcement = MulticastAnnouncement {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            ..self.template.clone()
        };
        let mut sent = 0;
        for provider in self.registry.providers() {
            match encode_announcement(provider, &announcement, &self.constraints) {
                Ok(datagrams) => sent += send_all(&self.socket, self.target, &datagrams).await,
                Err(e) => debug!("Not announcing in format {}: {}", provider.name(), e),
            }
        }
        trace!("Announcement {} sent as {} datagrams", announcement.sequence, sent);
        sent
    }

    pub fn spawn(self: Arc<Self>, pool: &WorkerPool, interval: Duration) -> JoinHandle<()> {
        info!("Announcing {} to {} every {:?}", self.template.registrar_id, self.target, interval);
        pool.spawn_periodic(interval, move || {
            let announcer = Arc::clone(&self);
            async move {
                announcer.announce_once().await;
            }
        })
    }
}

/// Answers multicast requests by connecting back to the requester and
/// serving unicast discovery over that connection.
pub struct MulticastResponder {
    registry: Arc<ProviderRegistry>,
    constraints: InvocationConstraints,
    subject_checker: Arc<dyn ClientSubjectChecker>,
    registrar_id: Uuid,
    groups: Vec<String>,
    connector: Arc<dyn Connector>,
    server: Arc<UnicastServer>,
    pool: WorkerPool,
}

impl MulticastResponder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        constraints: InvocationConstraints,
        subject_checker: Arc<dyn ClientSubjectChecker>,
        registrar_id: Uuid,
        groups: Vec<String>,
        connector: Arc<dyn Connector>,
        server: Arc<UnicastServer>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            registry,
            constraints,
            subject_checker,
            registrar_id,
            groups,
            connector,
            server,
            pool,
        }
    }

    /// Handles one received datagram. Returns the connect-back task when
    /// the request warrants an answer.
    pub fn handle_datagram(&self, bytes: Bytes, from: SocketAddr) -> Option<JoinHandle<()>> {
        let request = match decode_request(
            &self.registry,
            bytes,
            &self.constraints,
            self.subject_checker.as_ref(),
        ) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring multicast request from {}: {}", from, e);
                return None;
            }
        };
        if !request.wants_any_of(&self.groups) {
            trace!("Request from {} is for other groups", from);
            return None;
        }
        if request.heard_from.contains(&self.registrar_id) {
            trace!("Requester {} already knows us", from);
            return None;
        }

        let connector = Arc::clone(&self.connector);
        let server = Arc::clone(&self.server);
        let admission = server.admission_timeout();
        Some(self.pool.spawn_bounded(admission, async move {
            let target = format!("{}:{}", request.host, request.port);
            let deadline = server.deadline();
            let mut stream = match deadline
                .connect(&target, connector.connect(&request.host, request.port))
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Could not answer request from {}: {}", target, e);
                    return;
                }
            };
            match server.handle(stream.as_mut()).await {
                Ok(()) => info!("Answered multicast request from {}", target),
                Err(e) => warn!("Answering {} failed: {}", target, e),
            }
        }))
    }

    pub fn spawn(self: Arc<Self>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        pool.spawn_daemon(async move {
            let mut buf = vec![0u8; RECEIVE_BUFFER];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        self.handle_datagram(Bytes::copy_from_slice(&buf[..len]), from);
                    }
                    Err(e) => warn!("Multicast receive failed: {}", e),
                }
            }
        })
    }
}

/// Receives announcements, drops repeats and forwards the rest.
pub struct AnnouncementListener {
    registry: Arc<ProviderRegistry>,
    constraints: InvocationConstraints,
    /// Empty means every group
    interests: Vec<String>,
    retention: Duration,
    seen: Mutex<HashMap<Uuid, Heard>>,
}

struct Heard {
    sequence: u64,
    groups: BTreeSet<String>,
    at: Instant,
}

impl Heard {
    fn new(announcement: &MulticastAnnouncement) -> Self {
        Self {
            sequence: announcement.sequence,
            groups: announcement.groups.iter().cloned().collect(),
            at: Instant::now(),
        }
    }
}

impl AnnouncementListener {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        constraints: InvocationConstraints,
        interests: Vec<String>,
    ) -> Self {
        Self {
            registry,
            constraints,
            interests,
            retention: DEFAULT_RETENTION,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Registrars not heard from for `retention` are discarded and their
    /// next announcement is reported as new.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Registrars currently tracked
    pub fn tracked(&self) -> usize {
        self.seen.lock().len()
    }

    /// Decodes a datagram and returns the announcement if it is new and of
    /// interest.
    ///
    /// An announcement split over several datagrams shares one sequence
    /// number, so a repeat is one whose groups were all already seen at
    /// that sequence; older sequences are always repeats.
    pub fn accept(&self, bytes: Bytes) -> Result<Option<MulticastAnnouncement>> {
        let announcement = decode_announcement(&self.registry, bytes, &self.constraints)?;
        if !self.interests.is_empty()
            && !announcement.groups.iter().any(|g| self.interests.contains(g))
        {
            return Ok(None);
        }

        let mut seen = self.seen.lock();
        let retention = self.retention;
        seen.retain(|registrar_id, heard| {
            let live = heard.at.elapsed() < retention;
            if !live {
                debug!("Discarding registrar {} after {:?} of silence", registrar_id, retention);
            }
            live
        });
        let fresh = match seen.entry(announcement.registrar_id) {
            Entry::Vacant(slot) => {
                slot.insert(Heard::new(&announcement));
                true
            }
            Entry::Occupied(mut slot) => {
                let heard = slot.get_mut();
                if announcement.sequence < heard.sequence {
                    false
                } else if announcement.sequence > heard.sequence {
                    *heard = Heard::new(&announcement);
                    true
                } else {
                    heard.at = Instant::now();
                    announcement
                        .groups
                        .iter()
                        .fold(false, |fresh, g| heard.groups.insert(g.clone()) || fresh)
                }
            }
        };
        Ok(fresh.then_some(announcement))
    }

    /// Forgets a registrar so its next announcement is reported again.
    pub fn forget(&self, registrar_id: &Uuid) {
        self.seen.lock().remove(registrar_id);
    }

    pub fn spawn(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        pool: &WorkerPool,
    ) -> mpsc::Receiver<MulticastAnnouncement> {
        let (sender, receiver) = mpsc::channel(64);
        pool.spawn_daemon(async move {
            let mut buf = vec![0u8; RECEIVE_BUFFER];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Announcement receive failed: {}", e);
                        continue;
                    }
                };
                match self.accept(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(Some(announcement)) => {
                        if sender.send(announcement).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring announcement from {}: {}", from, e),
                }
            }
        });
        receiver
    }
}

/// Sends multicast requests and collects the unicast responses of the
/// lookup services that call back.
pub struct MulticastRequester {
    registry: Arc<ProviderRegistry>,
    constraints: InvocationConstraints,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    host: String,
    groups: Vec<String>,
    client: Arc<UnicastClient>,
    heard_from: Arc<Mutex<Vec<Uuid>>>,
}

struct ResponseCollector {
    client: Arc<UnicastClient>,
    heard_from: Arc<Mutex<Vec<Uuid>>>,
    responses: mpsc::Sender<UnicastResponse>,
}

#[async_trait]
impl Dispatcher for ResponseCollector {
    async fn dispatch(&self, mut stream: Box<dyn DiscoveryStream>, peer: SocketAddr) {
        let response = match self.client.discover_over(stream.as_mut()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Discovery callback from {} failed: {}", peer, e);
                return;
            }
        };
        match response.registrar_proxy() {
            Ok(proxy) => {
                let mut heard = self.heard_from.lock();
                if heard.contains(&proxy.registrar_id) {
                    return;
                }
                heard.push(proxy.registrar_id);
            }
            Err(e) => {
                warn!("Unreadable registrar from {}: {}", peer, e);
                return;
            }
        }
        let _ = self.responses.send(response).await;
    }
}

impl MulticastRequester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        constraints: InvocationConstraints,
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        host: String,
        groups: Vec<String>,
        client: Arc<UnicastClient>,
    ) -> Self {
        Self {
            registry,
            constraints,
            socket,
            target,
            host,
            groups,
            client,
            heard_from: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Lookup services heard from so far
    pub fn heard_from(&self) -> Vec<Uuid> {
        self.heard_from.lock().clone()
    }

    /// Sends one request round announcing `port` as the callback port.
    pub async fn request_once(&self, port: u16) -> usize {
        let request = MulticastRequest {
            host: self.host.clone(),
            port,
            groups: self.groups.clone(),
            heard_from: self.heard_from(),
        };
        let mut sent = 0;
        for provider in self.registry.providers() {
            match encode_request(provider, &request, &self.constraints) {
                Ok(datagrams) => sent += send_all(&self.socket, self.target, &datagrams).await,
                Err(e) => debug!("Not requesting in format {}: {}", provider.name(), e),
            }
        }
        sent
    }

    /// Starts listening for callbacks and sends `rounds` requests spaced
    /// by `interval`. Each distinct lookup service is reported once.
    pub async fn start(
        self: Arc<Self>,
        listener: &dyn Listener,
        pool: &WorkerPool,
        rounds: usize,
        interval: Duration,
    ) -> Result<(ListenCookie, mpsc::Receiver<UnicastResponse>)> {
        let (responses, receiver) = mpsc::channel(16);
        let collector = Arc::new(ResponseCollector {
            client: Arc::clone(&self.client),
            heard_from: Arc::clone(&self.heard_from),
            responses,
        });
        let cookie = listener.listen(collector).await?;
        let port = cookie.local_addr().port();

        let mut delay = Duration::ZERO;
        for round in 0..rounds {
            let requester = Arc::clone(&self);
            pool.spawn_after(delay, async move {
                let sent = requester.request_once(port).await;
                debug!("Request round {} sent {} datagrams", round, sent);
            });
            delay = delay.saturating_add(interval);
        }
        Ok((cookie, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Constraint;
    use crate::discovery::plaintext;
    use crate::discovery::subject::AllowAll;
    use crate::discovery::unicast::ResponseSource;

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::new().with(plaintext::provider()))
    }

    fn announcement(sequence: u64, groups: &[&str]) -> MulticastAnnouncement {
        MulticastAnnouncement {
            sequence,
            host: "lookup".into(),
            port: 4160,
            registrar_id: Uuid::from_u128(1),
            groups: groups.iter().map(ToString::to_string).collect(),
        }
    }

    fn encode(announcement: &MulticastAnnouncement) -> Bytes {
        encode_announcement(&plaintext::provider(), announcement, &InvocationConstraints::empty())
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_parse_rejects_other_versions() {
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        wire::put_str(&mut raw, plaintext::FORMAT_NAME).unwrap();
        assert!(matches!(
            Datagram::parse(raw.freeze()),
            Err(Error::UnsupportedProtocolVersion(1))
        ));
    }

    #[test]
    fn test_unknown_format_reported() {
        let registry = ProviderRegistry::new();
        let bytes = encode(&announcement(1, &["a"]));
        assert!(matches!(
            decode_announcement(&registry, bytes, &InvocationConstraints::empty()),
            Err(Error::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_listener_drops_repeats() {
        let listener = AnnouncementListener::new(registry(), InvocationConstraints::empty(), vec![]);

        assert!(listener.accept(encode(&announcement(5, &["a"]))).unwrap().is_some());
        assert!(listener.accept(encode(&announcement(5, &["a"]))).unwrap().is_none());
        // Second part of a split announcement
        assert!(listener.accept(encode(&announcement(5, &["b"]))).unwrap().is_some());
        // Stale
        assert!(listener.accept(encode(&announcement(4, &["c"]))).unwrap().is_none());
        assert!(listener.accept(encode(&announcement(6, &["a"]))).unwrap().is_some());

        listener.forget(&Uuid::from_u128(1));
        assert!(listener.accept(encode(&announcement(6, &["a"]))).unwrap().is_some());
    }

    #[test]
    fn test_listener_discards_silent_registrars() {
        let listener = AnnouncementListener::new(registry(), InvocationConstraints::empty(), vec![])
            .with_retention(Duration::from_millis(30));

        assert!(listener.accept(encode(&announcement(5, &["a"]))).unwrap().is_some());
        assert_eq!(listener.tracked(), 1);
        std::thread::sleep(Duration::from_millis(50));

        let other = MulticastAnnouncement {
            registrar_id: Uuid::from_u128(2),
            ..announcement(1, &["a"])
        };
        assert!(listener.accept(encode(&other)).unwrap().is_some());
        assert_eq!(listener.tracked(), 1);
        // The discarded registrar restarted with a lower sequence
        assert!(listener.accept(encode(&announcement(1, &["a"]))).unwrap().is_some());
        assert_eq!(listener.tracked(), 2);
    }

    #[test]
    fn test_undersized_packet_preference_ignored() {
        let constraints =
            InvocationConstraints::new([], [Constraint::MulticastMaxPacketSize(64)]).unwrap();
        let datagrams =
            encode_announcement(&plaintext::provider(), &announcement(1, &["a", "b"]), &constraints).unwrap();
        assert_eq!(datagrams.len(), 1);
        assert!(datagrams[0].len() > 64);
        assert!(datagrams[0].len() <= DEFAULT_MAX_PACKET_SIZE);

        let request = MulticastRequest {
            host: "client".into(),
            port: 4160,
            groups: vec!["a".into()],
            heard_from: vec![],
        };
        let datagrams = encode_request(&plaintext::provider(), &request, &constraints).unwrap();
        assert!(datagrams.iter().all(|d| d.len() <= DEFAULT_MAX_PACKET_SIZE));
    }

    #[test]
    fn test_listener_filters_groups() {
        let listener =
            AnnouncementListener::new(registry(), InvocationConstraints::empty(), vec!["prod".into()]);
        assert!(listener.accept(encode(&announcement(1, &["dev"]))).unwrap().is_none());
        assert!(listener.accept(encode(&announcement(2, &["dev", "prod"]))).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_announcer_sends_over_udp() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let announcer = MulticastAnnouncer::new(
            registry(),
            InvocationConstraints::empty(),
            sender,
            target,
            announcement(10, &[""]),
        );
        assert_eq!(announcer.announce_once().await, 1);
        assert_eq!(announcer.announce_once().await, 1);

        let listener = AnnouncementListener::new(registry(), InvocationConstraints::empty(), vec![]);
        let mut buf = vec![0u8; RECEIVE_BUFFER];
        let mut sequences = Vec::new();
        for _ in 0..2 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let announcement = listener
                .accept(Bytes::copy_from_slice(&buf[..len]))
                .unwrap()
                .unwrap();
            sequences.push(announcement.sequence);
        }
        assert_eq!(sequences, vec![10, 11]);
    }

    struct Never;

    impl ResponseSource for Never {
        fn unicast_response(&self) -> Result<UnicastResponse> {
            Err(Error::Config("unused".into()))
        }
    }

    #[tokio::test]
    async fn test_responder_ignores_garbage_and_known() {
        let registrar_id = Uuid::from_u128(9);
        let server = Arc::new(UnicastServer::new(
            registry(),
            InvocationConstraints::empty(),
            Arc::new(AllowAll),
            Arc::new(Never),
            Arc::new(landlord::SystemClock),
        ));
        let responder = MulticastResponder::new(
            registry(),
            InvocationConstraints::empty(),
            Arc::new(AllowAll),
            registrar_id,
            vec!["prod".into()],
            Arc::new(crate::transport::TcpConnector),
            server,
            WorkerPool::new("responder-test", 1),
        );
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(responder.handle_datagram(Bytes::from_static(b"junk"), from).is_none());

        let request = |groups: Vec<String>, heard_from: Vec<Uuid>| {
            encode_request(
                &plaintext::provider(),
                &MulticastRequest {
                    host: "127.0.0.1".into(),
                    port: 9,
                    groups,
                    heard_from,
                },
                &InvocationConstraints::empty(),
            )
            .unwrap()
            .remove(0)
        };
        assert!(responder
            .handle_datagram(request(vec!["dev".into()], vec![]), from)
            .is_none());
        assert!(responder
            .handle_datagram(request(vec![], vec![registrar_id]), from)
            .is_none());
    }
}
