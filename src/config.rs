// Node configuration - JSON file with defaults matching the Jini
// discovery conventions

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use landlord::{Clock, FixedLeasePeriodPolicy};

use crate::constraint::{Constraint, InvocationConstraints};
use crate::discovery::signed::{self, SignedFormat};
use crate::discovery::subject::{AllowAll, AllowList, ClientSubjectChecker};
use crate::discovery::{
    plaintext, ProviderRegistry, ANNOUNCEMENT_GROUP, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT,
    DEFAULT_TTL, MIN_PACKET_SIZE, PUBLIC_GROUP, REQUEST_GROUP,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host name lookup services advertise and requesters call back on
    pub host: String,
    pub unicast_port: u16,
    pub groups: Vec<String>,
    /// Known lookup services, `jini://host[:port]`
    pub locators: Vec<String>,
    /// Discovery formats in preference order
    pub formats: Vec<String>,
    pub unicast_constraints: InvocationConstraints,
    pub multicast_constraints: InvocationConstraints,
    pub request_group: SocketAddrV4,
    pub announcement_group: SocketAddrV4,
    pub announcement_interval_ms: u64,
    pub ttl: u32,
    pub max_packet_size: u32,
    pub socket_timeout_ms: u64,
    /// File holding this node's 32 byte ed25519 seed
    pub identity: Option<PathBuf>,
    /// Files holding 32 byte ed25519 public keys of trusted peers
    pub trusted_keys: Vec<PathBuf>,
    /// When set, only these client keys may use authenticated exchanges
    pub allowed_clients: Option<Vec<PathBuf>>,
    pub allow_anonymous: bool,
    pub lease: LeaseBounds,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseBounds {
    pub minimum_ms: u64,
    pub default_ms: u64,
    pub maximum_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for LeaseBounds {
    fn default() -> Self {
        Self {
            minimum_ms: 0,
            default_ms: 5 * 60 * 1000,
            maximum_ms: 10 * 60 * 1000,
            sweep_interval_ms: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            unicast_port: DEFAULT_PORT,
            groups: vec![PUBLIC_GROUP.into()],
            locators: Vec::new(),
            formats: vec![plaintext::FORMAT_NAME.into()],
            unicast_constraints: InvocationConstraints::empty(),
            multicast_constraints: InvocationConstraints::empty(),
            request_group: SocketAddrV4::new(REQUEST_GROUP, DEFAULT_PORT),
            announcement_group: SocketAddrV4::new(ANNOUNCEMENT_GROUP, DEFAULT_PORT),
            announcement_interval_ms: 120_000,
            ttl: DEFAULT_TTL,
            max_packet_size: u32::try_from(DEFAULT_MAX_PACKET_SIZE).unwrap_or(u32::MAX),
            socket_timeout_ms: 60_000,
            identity: None,
            trusted_keys: Vec::new(),
            allowed_clients: None,
            allow_anonymous: true,
            lease: LeaseBounds::default(),
            workers: 16,
        }
    }
}

impl Config {
    /// Reads and validates a JSON config file. Missing fields take their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.formats.is_empty() {
            return Err(Error::Config("at least one discovery format is required".into()));
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(Error::Config(format!(
                "max_packet_size {} is below the minimum of {MIN_PACKET_SIZE}",
                self.max_packet_size
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.announcement_interval_ms == 0 || self.lease.sweep_interval_ms == 0 {
            return Err(Error::Config("intervals must be positive".into()));
        }
        let lease = &self.lease;
        if lease.minimum_ms > lease.maximum_ms || lease.maximum_ms == 0 {
            return Err(Error::Config(format!(
                "lease bounds [{}, {}] are empty",
                lease.minimum_ms, lease.maximum_ms
            )));
        }
        if self.request_group.ip().is_multicast() && self.announcement_group.ip().is_multicast() {
            Ok(())
        } else {
            Err(Error::Config("discovery groups must be multicast addresses".into()))
        }
    }

    /// Providers for the configured formats, in configured order.
    pub fn build_registry(&self) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        for name in &self.formats {
            let provider = match name.as_str() {
                plaintext::FORMAT_NAME => plaintext::provider(),
                signed::FORMAT_NAME => signed::provider(self.signed_format()?),
                other => return Err(Error::UnknownFormat(other.to_string())),
            };
            registry = registry.with(provider);
        }
        Ok(registry)
    }

    pub fn signed_format(&self) -> Result<SignedFormat> {
        let identity = self.identity.as_deref().map(read_identity).transpose()?;
        let trusted = self
            .trusted_keys
            .iter()
            .map(|path| read_public_key(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(SignedFormat::new(identity, trusted))
    }

    pub fn subject_checker(&self) -> Result<Arc<dyn ClientSubjectChecker>> {
        match &self.allowed_clients {
            None => Ok(Arc::new(AllowAll)),
            Some(paths) => {
                let keys = paths
                    .iter()
                    .map(|path| read_public_key(path))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(AllowList::new(keys).allow_anonymous(self.allow_anonymous)))
            }
        }
    }

    /// Configured unicast constraints plus the socket timeout as a
    /// preference.
    pub fn unicast_constraints(&self) -> Result<InvocationConstraints> {
        let defaults = InvocationConstraints::new(
            [],
            [Constraint::UnicastSocketTimeout(self.socket_timeout_ms)],
        )?;
        self.unicast_constraints.combine(&defaults)
    }

    /// Configured multicast constraints plus packet size and TTL as
    /// preferences.
    pub fn multicast_constraints(&self) -> Result<InvocationConstraints> {
        let defaults = InvocationConstraints::new(
            [],
            [
                Constraint::MulticastMaxPacketSize(self.max_packet_size),
                Constraint::MulticastTimeToLive(self.ttl),
            ],
        )?;
        self.multicast_constraints.combine(&defaults)
    }

    pub fn lease_policy(&self, clock: Arc<dyn Clock>) -> FixedLeasePeriodPolicy {
        FixedLeasePeriodPolicy::new(
            Duration::from_millis(self.lease.minimum_ms),
            Duration::from_millis(self.lease.default_ms),
            Duration::from_millis(self.lease.maximum_ms),
            clock,
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease.sweep_interval_ms)
    }

    pub fn announcement_interval(&self) -> Duration {
        Duration::from_millis(self.announcement_interval_ms)
    }
}

fn read_key_bytes(path: &Path) -> Result<[u8; 32]> {
    let bytes = std::fs::read(path).map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Error::Config(format!("{} must hold exactly 32 bytes", path.display())))
}

pub fn read_identity(path: &Path) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&read_key_bytes(path)?))
}

pub fn read_public_key(path: &Path) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&read_key_bytes(path)?)
        .map_err(|e| Error::Config(format!("{} is not an ed25519 public key: {e}", path.display())))
}

/// Writes a fresh identity as `<name>.key` (seed) and `<name>.pub` into
/// `dir`, returning both paths.
pub fn write_identity(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
    let key = signed::generate_identity();
    let secret = dir.join(format!("{name}.key"));
    let public = dir.join(format!("{name}.pub"));
    std::fs::write(&secret, key.to_bytes())?;
    std::fs::write(&public, key.verifying_key().to_bytes())?;
    Ok((secret, public))
}

#[cfg(test)]
mod tests {
    use super::*;
    use landlord::ManualClock;

    #[test]
    fn test_defaults_follow_discovery_conventions() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.unicast_port, 4160);
        assert_eq!(config.request_group.to_string(), "224.0.1.85:4160");
        assert_eq!(config.announcement_group.to_string(), "224.0.1.84:4160");
        assert_eq!(config.groups, vec![String::new()]);
        assert_eq!(config.announcement_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("river.json");
        std::fs::write(
            &path,
            r#"{
                "unicast_port": 4170,
                "groups": ["printers"],
                "unicast_constraints": { "requirements": [ { "UnicastSocketTimeout": 5000 } ] },
                "lease": { "maximum_ms": 60000 }
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.unicast_port, 4170);
        assert_eq!(config.groups, vec!["printers".to_string()]);
        assert_eq!(config.ttl, DEFAULT_TTL);
        assert_eq!(config.lease.default_ms, 5 * 60 * 1000);

        // The configured timeout is tighter than the default preference
        let unicast = config.unicast_constraints().unwrap();
        assert_eq!(unicast.socket_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(Config::load(&missing), Err(Error::Config(_))));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(Config::load(&garbage), Err(Error::Config(_))));

        let tiny = dir.path().join("tiny.json");
        std::fs::write(&tiny, r#"{ "max_packet_size": 64 }"#).unwrap();
        assert!(matches!(Config::load(&tiny), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let config = Config {
            formats: vec!["net.jini.discovery.kerberos".into()],
            ..Config::default()
        };
        assert!(matches!(config.build_registry(), Err(Error::UnknownFormat(_))));
    }

    #[test]
    fn test_registry_with_signed_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, public) = write_identity(dir.path(), "lookup").unwrap();

        let config = Config {
            formats: vec![signed::FORMAT_NAME.into(), plaintext::FORMAT_NAME.into()],
            identity: Some(secret.clone()),
            trusted_keys: vec![public.clone()],
            ..Config::default()
        };
        let registry = config.build_registry().unwrap();
        assert_eq!(
            registry.names(),
            vec![signed::FORMAT_NAME.to_string(), plaintext::FORMAT_NAME.to_string()]
        );
        assert_eq!(
            config.signed_format().unwrap().public_key(),
            Some(read_public_key(&public).unwrap())
        );
        assert_eq!(
            read_identity(&secret).unwrap().verifying_key(),
            read_public_key(&public).unwrap()
        );
    }

    #[test]
    fn test_short_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pub");
        std::fs::write(&path, [7u8; 16]).unwrap();
        assert!(matches!(read_public_key(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_multicast_constraints_carry_packet_limits() {
        let config = Config {
            max_packet_size: 1024,
            ttl: 3,
            ..Config::default()
        };
        let multicast = config.multicast_constraints().unwrap();
        assert_eq!(multicast.max_packet_size(), Some(1024));
        assert_eq!(multicast.time_to_live(), Some(3));
    }

    #[test]
    fn test_lease_policy_uses_bounds() {
        use landlord::{LeasePeriodPolicy, LeaseCookie, LeasedResource, RequestedDuration};

        struct Slot;
        impl LeasedResource for Slot {
            fn cookie(&self) -> LeaseCookie {
                LeaseCookie::default()
            }
            fn expiration(&self) -> u64 {
                0
            }
            fn set_expiration(&mut self, _: u64) {}
        }

        let config = Config::default();
        let policy = config.lease_policy(Arc::new(ManualClock::new(1_000)));
        let granted = policy.grant(&Slot, RequestedDuration::Forever).unwrap();
        assert_eq!(granted.duration, config.lease.maximum_ms);
        assert_eq!(granted.expiration, 1_000 + config.lease.maximum_ms);
    }
}
