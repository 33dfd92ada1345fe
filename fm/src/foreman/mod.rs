//! Foreman - expiry sweeps, revocation and module broadcast
//!
//! The Foreman asks the StateManager which documents have gone stale, revokes every
//! assignment of those documents concurrently, and frees a slot only after the
//! holding worker acknowledges the revoke.

mod config;
mod core;
mod outcome;

pub use config::{ExpiryPolicy, ForemanConfig};
pub use core::Foreman;
pub use outcome::{BroadcastReport, RevokeOutcome, RevokeStatus, SweepSummary};
