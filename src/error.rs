use std::io;
use thiserror::Error;

use crate::constraint::Constraint;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Constraint {constraint:?} cannot be satisfied by format {format}")]
    UnsupportedConstraint { constraint: Constraint, format: String },

    #[error("Incoherent constraints: {0:?} is both required and forbidden")]
    IncoherentConstraints(Constraint),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown discovery format {0:?}")]
    UnknownFormat(String),

    #[error("Unsupported discovery protocol version {0}")]
    UnsupportedProtocolVersion(u32),

    #[error("No mutually acceptable discovery format among {offered:?}")]
    FormatRejected { offered: Vec<String> },

    #[error("Datagram overflow: {needed} bytes needed but only {limit} fit")]
    DatagramOverflow { needed: usize, limit: usize },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Transport failure during {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Malformed locator {locator:?}: {reason}")]
    MalformedLocator { locator: String, reason: String },

    #[error("No lookup service found after {attempts} attempts")]
    NoLookupService {
        attempts: usize,
        #[source]
        last: Option<Box<Error>>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lease error: {0}")]
    Lease(#[from] landlord::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedMessage(reason.into())
    }

    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            context: context.into(),
            source,
        }
    }

    /// Whether the caller may reasonably retry the same operation unchanged.
    ///
    /// Transport failures and timeouts are retryable; constraint, protocol,
    /// authorization and lease denials are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Timeout(_) | Error::Io(_) => true,
            Error::NoLookupService { last, .. } => last.as_ref().is_some_and(|e| e.is_retryable()),
            Error::Lease(e) => e.is_indefinite(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
