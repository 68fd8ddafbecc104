// Lookup locators - `jini://host[:port]` addresses of known lookup services

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::unicast::UnicastClient;
use super::{UnicastResponse, DEFAULT_PORT};

const SCHEME: &str = "jini://";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LookupLocator {
    host: String,
    port: u16,
}

impl LookupLocator {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        validate_host(&host).map_err(|reason| Error::MalformedLocator {
            locator: format!("{SCHEME}{host}:{port}"),
            reason,
        })?;
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host as handed to the resolver, without IPv6 brackets
    pub fn connect_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    /// Runs unicast discovery against this locator.
    pub async fn discover(&self, client: &UnicastClient) -> Result<UnicastResponse> {
        client.discover(self.connect_host(), self.port).await
    }
}

fn validate_host(host: &str) -> std::result::Result<(), String> {
    if host.is_empty() {
        return Err("missing host".into());
    }
    if let Some(inner) = host.strip_prefix('[') {
        return match inner.strip_suffix(']') {
            Some(addr) if addr.parse::<std::net::Ipv6Addr>().is_ok() => Ok(()),
            _ => Err("bad IPv6 literal".into()),
        };
    }
    if host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        Ok(())
    } else {
        Err(format!("invalid host {host:?}"))
    }
}

impl FromStr for LookupLocator {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedLocator {
            locator: text.to_string(),
            reason: reason.to_string(),
        };

        let rest = text
            .get(..SCHEME.len())
            .filter(|scheme| scheme.eq_ignore_ascii_case(SCHEME))
            .map(|_| &text[SCHEME.len()..])
            .ok_or_else(|| malformed("scheme must be jini://"))?;
        // A trailing slash is allowed, a path is not
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.contains(['/', '?', '#', '@']) {
            return Err(malformed("unexpected path, query or user info"));
        }

        let (host, port) = match authority.rfind(':') {
            Some(colon) if !authority.ends_with(']') => {
                let port = authority[colon + 1..]
                    .parse::<u16>()
                    .map_err(|_| malformed("bad port"))?;
                (&authority[..colon], port)
            }
            _ => (authority, DEFAULT_PORT),
        };
        if port == 0 {
            return Err(malformed("port must be non-zero"));
        }
        validate_host(host).map_err(|reason| malformed(&reason))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for LookupLocator {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        text.parse()
    }
}

impl From<LookupLocator> for String {
    fn from(locator: LookupLocator) -> Self {
        locator.to_string()
    }
}

impl fmt::Display for LookupLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{SCHEME}{}", self.host)
        } else {
            write!(f, "{SCHEME}{}:{}", self.host, self.port)
        }
    }
}

/// Tries each locator in order and returns the first successful discovery.
///
/// Entries that fail to parse are skipped with a warning. When every
/// attempt fails the last error is kept as the cause.
pub async fn discover_any<S: AsRef<str>>(
    client: &UnicastClient,
    locators: &[S],
) -> Result<(LookupLocator, UnicastResponse)> {
    let mut attempts = 0;
    let mut last = None;
    for text in locators {
        let locator = match text.as_ref().parse::<LookupLocator>() {
            Ok(locator) => locator,
            Err(e) => {
                warn!("Skipping locator: {}", e);
                continue;
            }
        };
        attempts += 1;
        match locator.discover(client).await {
            Ok(response) => {
                debug!("Discovered lookup service at {}", locator);
                return Ok((locator, response));
            }
            Err(e) => {
                debug!("Discovery at {} failed: {}", locator, e);
                last = Some(Box::new(e));
            }
        }
    }
    Err(Error::NoLookupService { attempts, last })
}
