//! Foreman - work-assignment scheduler for collaborative document workers
//!
//! Worker processes connect over a transport and are bound to
//! (tenant, document, task type) triples. The scheduler keeps each triple on at
//! most one worker, notices when a document has gone idle or its worker stale, and
//! hands the work back only after the holding worker acknowledges a revoke.
//!
//! # Modules
//!
//! - [`domain`] - Identifiers, workers and assignments
//! - [`state`] - Worker registry and assignment table
//! - [`transport`] - Worker transport contract and an in-process channel transport
//! - [`foreman`] - Expiry sweeps, revocation and module broadcast
//! - [`config`] - Configuration types and loading
//! - [`sim`] - Simulated worker pools
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod foreman;
pub mod sim;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use domain::{
    Assignment, AssignmentKey, ClientId, DocumentId, ExpiredDocument, TaskType, TenantId, TransportHandle, Worker,
    WorkerDetail, WorkerKind,
};
pub use foreman::{
    BroadcastReport, ExpiryPolicy, Foreman, ForemanConfig, RevokeOutcome, RevokeStatus, SweepSummary,
};
pub use state::{ManagerMetrics, StateError, StateEvent, StateManager, StateResponse};
pub use transport::{
    AckCallback, AckError, AckReply, ChannelTransport, Envelope, NackInfo, WorkerConnection, WorkerMessage,
    WorkerTransport, request,
};
