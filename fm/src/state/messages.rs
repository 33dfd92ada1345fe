//! State manager errors and change events

use thiserror::Error;

use crate::domain::{AssignmentKey, ClientId, TaskType, WorkerKind};

/// Errors from state operations
///
/// These are routine outcomes (conflicts, missing keys), returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Assignment {key} is already held by {holder}")]
    AlreadyAssigned { key: AssignmentKey, holder: ClientId },

    #[error("No assignment for {0}")]
    NotAssigned(AssignmentKey),

    #[error("Worker not registered: {0}")]
    UnknownWorker(ClientId),

    #[error("Task type not managed by this scheduler: {0}")]
    UnknownTaskType(TaskType),
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Event broadcast whenever the registry or assignment table changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    WorkerRegistered { client_id: ClientId, kind: WorkerKind },
    /// A worker left; `assignments` were reaped with it
    WorkerUnregistered { client_id: ClientId, assignments: usize },
    AssignmentBound { key: AssignmentKey, client_id: ClientId },
    AssignmentRemoved { key: AssignmentKey, client_id: ClientId },
    /// Removed without the holder's acknowledgment after repeated failed revokes
    AssignmentEvicted {
        key: AssignmentKey,
        client_id: ClientId,
        failures: u32,
    },
}
