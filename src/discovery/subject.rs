// Client subject checks - who may take part in discovery with this node

use ed25519_dalek::VerifyingKey;
use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};

/// An authenticated discovery peer, identified by its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientSubject {
    key: [u8; 32],
}

impl ClientSubject {
    pub fn new(key: &VerifyingKey) -> Self {
        Self { key: key.to_bytes() }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Short stable name for logs
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

impl fmt::Debug for ClientSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSubject({})", self.fingerprint())
    }
}

/// First 16 hex digits of the BLAKE3 hash of a public key.
pub fn fingerprint(key: &[u8; 32]) -> String {
    let hash = blake3::hash(key);
    hash.to_hex()[..16].to_string()
}

/// Decides whether a peer may participate. `None` is an unauthenticated
/// peer.
pub trait ClientSubjectChecker: Send + Sync + fmt::Debug {
    fn check_client_subject(&self, subject: Option<&ClientSubject>) -> Result<()>;
}

/// Admits everyone, authenticated or not.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ClientSubjectChecker for AllowAll {
    fn check_client_subject(&self, _subject: Option<&ClientSubject>) -> Result<()> {
        Ok(())
    }
}

/// Admits only listed keys, and anonymous peers if enabled.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    keys: HashSet<[u8; 32]>,
    allow_anonymous: bool,
}

impl AllowList {
    pub fn new(keys: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| k.to_bytes()).collect(),
            allow_anonymous: false,
        }
    }

    #[must_use]
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }
}

impl ClientSubjectChecker for AllowList {
    fn check_client_subject(&self, subject: Option<&ClientSubject>) -> Result<()> {
        match subject {
            None if self.allow_anonymous => Ok(()),
            None => Err(Error::AccessDenied("anonymous client".into())),
            Some(subject) if self.keys.contains(subject.key()) => Ok(()),
            Some(subject) => Err(Error::AccessDenied(format!(
                "client {} is not on the allow list",
                subject.fingerprint()
            ))),
        }
    }
}
