// Transport - stream abstraction, deadlines and the TCP connect/listen
// roles used by unicast discovery

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use landlord::Clock;

use crate::constraint::InvocationConstraints;
use crate::error::{Error, Result};
use crate::executor::WorkerPool;

/// Bidirectional byte stream a discovery exchange runs over.
pub trait DiscoveryStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DiscoveryStream for T {}

/// Time bounds for one unicast exchange: an absolute deadline for
/// establishing the connection and a per-operation bound on reads and
/// writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    connect: Option<Instant>,
    io: Option<Duration>,
}

impl Deadline {
    pub fn none() -> Self {
        Self::default()
    }

    /// Derives bounds from the exchange's constraints, anchored at the
    /// clock's current time.
    pub fn from_constraints(constraints: &InvocationConstraints, clock: &dyn Clock) -> Self {
        let now = clock.now_millis();
        let connect = constraints
            .connection_deadline(now)
            .map(|at| Instant::now() + Duration::from_millis(at.saturating_sub(now)));
        Self {
            connect,
            io: constraints.socket_timeout(),
        }
    }

    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io = Some(self.io.map_or(timeout, |io| io.min(timeout)));
        self
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io
    }

    /// Runs a connection attempt, aborting it when the connect deadline
    /// passes.
    pub async fn connect<T, F>(&self, what: &str, attempt: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let outcome = match self.connect {
            Some(at) => tokio::time::timeout_at(at, attempt)
                .await
                .map_err(|_| Error::Timeout("connect"))?,
            None => attempt.await,
        };
        outcome.map_err(|e| Error::transport(format!("connect to {what}"), e))
    }

    /// Runs a single read or write, aborting it when the socket timeout
    /// elapses.
    pub async fn io<T, F>(&self, what: &'static str, op: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let outcome = match self.io {
            Some(timeout) => tokio::time::timeout(timeout, op)
                .await
                .map_err(|_| Error::Timeout(what))?,
            None => op.await,
        };
        outcome.map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::malformed(format!("stream closed during {what}")),
            _ => Error::transport(what, e),
        })
    }
}

/// Opens outbound streams.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn DiscoveryStream>>;
}

/// Handles one accepted stream.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, stream: Box<dyn DiscoveryStream>, peer: SocketAddr);

    /// How long an accepted stream may wait for a free worker before it is
    /// closed unserved. `None` waits indefinitely.
    fn admission_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Accepts inbound streams and hands each to a dispatcher.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn listen(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<ListenCookie>;
}

/// Handle to an active listen operation.
///
/// Closing (or dropping) it stops the accept loop; connections that arrive
/// afterwards are never dispatched.
#[derive(Debug)]
pub struct ListenCookie {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ListenCookie {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn DiscoveryStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// TCP listen endpoint; accepted connections are dispatched on the pool.
#[derive(Debug, Clone)]
pub struct TcpListenEndpoint {
    addr: SocketAddr,
    pool: WorkerPool,
}

impl TcpListenEndpoint {
    pub fn new(addr: SocketAddr, pool: WorkerPool) -> Self {
        Self { addr, pool }
    }
}

#[async_trait]
impl Listener for TcpListenEndpoint {
    async fn listen(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<ListenCookie> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::transport(format!("bind {}", self.addr), e))?;
        let local_addr = listener.local_addr()?;
        info!("Listening for discovery connections on {}", local_addr);

        let (shutdown, stopped) = watch::channel(false);
        let handle = self
            .pool
            .spawn_daemon(accept_loop(listener, dispatcher, self.pool.clone(), stopped));

        Ok(ListenCookie {
            local_addr,
            shutdown,
            handle,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<dyn Dispatcher>,
    pool: WorkerPool,
    mut stopped: watch::Receiver<bool>,
) {
    let local_addr = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if *stopped.borrow() || pool.is_shut_down() {
                    debug!("Dropping connection from {} after close", peer);
                    break;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", peer, e);
                }
                let dispatcher = Arc::clone(&dispatcher);
                pool.spawn_bounded(dispatcher.admission_timeout(), async move {
                    dispatcher.dispatch(Box::new(stream), peer).await;
                });
            }
            Err(e) if is_transient(&e) => {
                warn!("Accept failed transiently: {}", e);
            }
            Err(e) => {
                error!("Accept failed, closing listener: {}", e);
                break;
            }
        }
    }
    // Dropping the socket here refuses anything still queued
    info!("Listener on {:?} closed", local_addr);
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
