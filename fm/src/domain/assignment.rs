//! Task assignments, keyed per (tenant, document, task type)

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::ids::{ClientId, DocumentId, TaskType, TenantId};
use super::worker::Worker;

/// Unique key of an assignment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssignmentKey {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub task_type: TaskType,
}

impl AssignmentKey {
    pub fn new(tenant_id: impl Into<TenantId>, document_id: impl Into<DocumentId>, task_type: impl Into<TaskType>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            document_id: document_id.into(),
            task_type: task_type.into(),
        }
    }

    /// True when both keys belong to the same document
    pub fn same_document(&self, tenant_id: &TenantId, document_id: &DocumentId) -> bool {
        &self.tenant_id == tenant_id && &self.document_id == document_id
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.document_id, self.task_type)
    }
}

/// Binding of one task type, for one document, to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub key: AssignmentKey,
    /// Holder of the task; always a registered worker
    pub client_id: ClientId,
    pub assigned_at: Instant,
    pub last_activity_at: Instant,
    /// Consecutive sweeps whose revoke of this assignment failed
    pub revoke_failures: u32,
}

impl Assignment {
    pub fn new(key: AssignmentKey, client_id: ClientId, now: Instant) -> Self {
        Self {
            key,
            client_id,
            assigned_at: now,
            last_activity_at: now,
            revoke_failures: 0,
        }
    }

    /// Record activity, keeping `last_activity_at >= assigned_at`
    pub fn touch(&mut self, now: Instant) {
        self.last_activity_at = now.max(self.assigned_at);
        self.revoke_failures = 0;
    }

    /// True when the assignment has seen no activity for longer than `timeout`
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity_at) > timeout
    }
}

/// A document with at least one expired assignment, listing all of its current assignments
#[derive(Debug, Clone)]
pub struct ExpiredDocument {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub assignments: Vec<(TaskType, Worker)>,
}

impl ExpiredDocument {
    /// Assignment keys of every task in this document
    pub fn keys(&self) -> impl Iterator<Item = AssignmentKey> + '_ {
        self.assignments.iter().map(|(task_type, _)| AssignmentKey {
            tenant_id: self.tenant_id.clone(),
            document_id: self.document_id.clone(),
            task_type: task_type.clone(),
        })
    }
}
