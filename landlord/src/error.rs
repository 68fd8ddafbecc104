use thiserror::Error;

use crate::lease::LeaseCookie;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Lease denied (requested {requested}ms): {reason}")]
    LeaseDenied { requested: i64, reason: String },

    #[error("Unknown lease {cookie}")]
    UnknownLease { cookie: LeaseCookie },

    #[error("Invalid lease duration: {0}")]
    InvalidDuration(i64),

    #[error("Landlord unreachable: {0}")]
    Unreachable(String),

    #[error("{} of {attempted} lease cancellations failed", .failed.len())]
    CancelAll {
        attempted: usize,
        failed: Vec<(LeaseCookie, Error)>,
    },
}

impl Error {
    /// Whether the outcome of the lease operation is unknown and a retry may
    /// succeed.
    pub fn is_indefinite(&self) -> bool {
        matches!(self, Error::Unreachable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
