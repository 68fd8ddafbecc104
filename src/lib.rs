#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Jini-style discovery of lookup services: constraint checking, pluggable
//! discovery formats, multicast and unicast discovery, and a small lookup
//! service whose registrations are leased through `landlord`.

mod cli;
pub use cli::{Cli, Commands};

pub mod config;
pub mod constraint;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod registrar;
pub mod transport;

pub use config::Config;
pub use constraint::{Constraint, ConstraintChecker, InvocationConstraints};
pub use discovery::locator::LookupLocator;
pub use discovery::unicast::{UnicastClient, UnicastServer};
pub use discovery::{DiscoveryProvider, ProviderRegistry, UnicastResponse};
pub use error::{Error, Result};
pub use executor::WorkerPool;
pub use registrar::{LookupService, RegistrarProxy};
