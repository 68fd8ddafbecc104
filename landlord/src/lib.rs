#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Landlord leasing: lease period policies, the leased resource registry
//! and the client-side renewal manager.

pub mod clock;
pub mod error;
pub mod expirer;
pub mod lease;
pub mod policy;
pub mod registry;
pub mod renewal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use expirer::LeaseExpirer;
pub use lease::{Lease, LeaseCookie, RequestedDuration};
pub use policy::{FixedLeasePeriodPolicy, LeasePeriodPolicy, PolicyResult};
pub use registry::{Landlord, LeaseRegistry, LeaseStatus, LeasedResource};
pub use renewal::{LeaseRenewalManager, RenewalEvent};
