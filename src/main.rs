use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use landlord::{Clock, LeaseExpirer, SystemClock};
use river::config::{write_identity, Config};
use river::discovery::locator::discover_any;
use river::discovery::multicast::{
    bind_group, bind_sender, AnnouncementListener, MulticastAnnouncer, MulticastRequester,
    MulticastResponder,
};
use river::discovery::unicast::{UnicastClient, UnicastServer};
use river::discovery::{MulticastAnnouncement, UnicastResponse, DEFAULT_TTL};
use river::executor::WorkerPool;
use river::registrar::{LookupService, RegistrarProxy};
use river::transport::{Listener, TcpConnector, TcpListenEndpoint};
use river::{Cli, Commands};

/// Multicast request rounds sent when no locator is known
const REQUEST_ROUNDS: usize = 7;
const REQUEST_INTERVAL: Duration = Duration::from_secs(5);

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    if let Commands::Keygen { dir, name } = &cli.command {
        return keygen(dir, name);
    }

    let config = cli.load_config().context("loading configuration")?;
    match &cli.command {
        Commands::Serve { .. } => serve(config).await,
        Commands::Discover { locators } => discover(config, locators).await,
        Commands::Listen { groups } => listen(config, groups.clone()).await,
        Commands::Keygen { .. } => Ok(()),
    }
}

fn keygen(dir: &Path, name: &str) -> Result<()> {
    let (secret, public) =
        write_identity(dir, name).with_context(|| format!("writing identity into {}", dir.display()))?;
    println!("seed:       {}", secret.display());
    println!("public key: {}", public.display());
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(config.build_registry()?);
    let unicast = config.unicast_constraints()?;
    let multicast = config.multicast_constraints()?;
    let subject_checker = config.subject_checker()?;
    let pool = WorkerPool::new("river", config.workers);

    let registrar_id = Uuid::new_v4();
    let lookup = Arc::new(LookupService::new(
        RegistrarProxy {
            registrar_id,
            host: config.host.clone(),
            port: config.unicast_port,
            groups: config.groups.clone(),
        },
        Arc::new(config.lease_policy(Arc::clone(&clock))),
        Arc::clone(&clock),
    ));
    let expirer = LeaseExpirer::spawn(Arc::clone(lookup.leases()), config.sweep_interval());

    let server = Arc::new(UnicastServer::new(
        Arc::clone(&registry),
        unicast,
        Arc::clone(&subject_checker),
        lookup,
        Arc::clone(&clock),
    ));
    let endpoint = TcpListenEndpoint::new(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.unicast_port)),
        pool.clone(),
    );
    let cookie = endpoint
        .listen(server.clone())
        .await
        .context("starting unicast discovery listener")?;
    info!("Lookup service {} listening on {}", registrar_id, cookie.local_addr());

    // Multicast is optional: a host without a multicast route still serves
    // unicast discovery
    let ttl = multicast.time_to_live().unwrap_or(DEFAULT_TTL);
    match bind_sender(ttl).await {
        Ok(sender) => {
            let announcer = Arc::new(MulticastAnnouncer::new(
                Arc::clone(&registry),
                multicast.clone(),
                Arc::new(sender),
                SocketAddr::V4(config.announcement_group),
                MulticastAnnouncement {
                    sequence: clock.now_millis(),
                    host: config.host.clone(),
                    port: config.unicast_port,
                    registrar_id,
                    groups: config.groups.clone(),
                },
            ));
            announcer.spawn(&pool, config.announcement_interval());
        }
        Err(e) => warn!("Multicast announcements disabled: {}", e),
    }
    match bind_group(config.request_group).await {
        Ok(socket) => {
            let responder = Arc::new(MulticastResponder::new(
                registry,
                multicast,
                subject_checker,
                registrar_id,
                config.groups.clone(),
                Arc::new(TcpConnector),
                server,
                pool.clone(),
            ));
            responder.spawn(Arc::new(socket));
        }
        Err(e) => warn!("Multicast requests will not be answered: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down lookup service {}", registrar_id);
    pool.shutdown();
    cookie.close().await;
    expirer.stop().await;
    Ok(())
}

async fn discover(config: Config, locators: &[String]) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(config.build_registry()?);
    let client = UnicastClient::new(
        Arc::clone(&registry),
        config.unicast_constraints()?,
        Arc::new(TcpConnector),
        clock,
    );

    let locators: &[String] = if locators.is_empty() { &config.locators } else { locators };
    if !locators.is_empty() {
        let (locator, response) = discover_any(&client, locators).await?;
        return print_response(&locator.to_string(), &response);
    }

    // No locators: ask on the request group and wait for a callback
    let multicast = config.multicast_constraints()?;
    let pool = WorkerPool::new("river-discover", config.workers);
    let sender = bind_sender(multicast.time_to_live().unwrap_or(DEFAULT_TTL)).await?;
    let requester = Arc::new(MulticastRequester::new(
        registry,
        multicast,
        Arc::new(sender),
        SocketAddr::V4(config.request_group),
        config.host.clone(),
        config.groups.clone(),
        Arc::new(client),
    ));
    let endpoint = TcpListenEndpoint::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), pool.clone());
    let (cookie, mut responses) = requester
        .start(&endpoint, &pool, REQUEST_ROUNDS, REQUEST_INTERVAL)
        .await?;

    let wait = REQUEST_INTERVAL * u32::try_from(REQUEST_ROUNDS).unwrap_or(u32::MAX);
    let first = tokio::time::timeout(wait, responses.recv()).await;
    cookie.close().await;
    pool.shutdown();
    match first {
        Ok(Some(response)) => print_response("multicast", &response),
        _ => bail!("no lookup service answered on {}", config.request_group),
    }
}

async fn listen(config: Config, groups: Vec<String>) -> Result<()> {
    let registry = Arc::new(config.build_registry()?);
    let socket = bind_group(config.announcement_group)
        .await
        .context("joining the announcement group")?;
    let pool = WorkerPool::new("river-listen", config.workers);
    let listener = Arc::new(AnnouncementListener::new(
        registry,
        config.multicast_constraints()?,
        groups,
    )
    .with_retention(config.announcement_interval().saturating_mul(10)));
    let mut announcements = listener.spawn(Arc::new(socket), &pool);
    info!("Listening for announcements on {}", config.announcement_group);

    loop {
        tokio::select! {
            announcement = announcements.recv() => match announcement {
                Some(a) => println!(
                    "{} jini://{}:{} seq={} groups={:?}",
                    a.registrar_id, a.host, a.port, a.sequence, a.groups
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    pool.shutdown();
    Ok(())
}

fn print_response(source: &str, response: &UnicastResponse) -> Result<()> {
    let proxy = response.registrar_proxy()?;
    println!(
        "{} via {}: jini://{}:{} groups={:?}",
        proxy.registrar_id, source, response.host, response.port, response.groups
    );
    Ok(())
}
