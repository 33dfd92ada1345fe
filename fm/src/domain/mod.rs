//! Domain types for work assignment
//!
//! Workers connect and declare a [`WorkerKind`]. Each (tenant, document, task type)
//! triple is bound to at most one worker at a time through an [`Assignment`].

mod assignment;
mod ids;
mod worker;

pub use assignment::{Assignment, AssignmentKey, ExpiredDocument};
pub use ids::{ClientId, DocumentId, TaskType, TenantId};
pub use worker::{TransportHandle, Worker, WorkerDetail, WorkerKind};
