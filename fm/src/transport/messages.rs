//! Messages sent to workers and their acknowledgments

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::{AssignmentKey, DocumentId, TaskType, TenantId};

/// Named messages the scheduler sends to workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Stop processing a task and release the assignment
    Revoke {
        #[serde(rename = "tenant-id")]
        tenant_id: TenantId,
        #[serde(rename = "document-id")]
        document_id: DocumentId,
        #[serde(rename = "task-type")]
        task_type: TaskType,
    },

    /// Load or activate an agent module
    LoadModule {
        #[serde(rename = "module-name")]
        module_name: String,
        action: String,
    },
}

impl WorkerMessage {
    pub fn revoke(key: &AssignmentKey) -> Self {
        Self::Revoke {
            tenant_id: key.tenant_id.clone(),
            document_id: key.document_id.clone(),
            task_type: key.task_type.clone(),
        }
    }

    pub fn load_module(module_name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::LoadModule {
            module_name: module_name.into(),
            action: action.into(),
        }
    }

    /// Message name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Revoke { .. } => "revoke",
            Self::LoadModule { .. } => "load-module",
        }
    }

    /// The assignment a revoke refers to
    pub fn assignment_key(&self) -> Option<AssignmentKey> {
        match self {
            Self::Revoke {
                tenant_id,
                document_id,
                task_type,
            } => Some(AssignmentKey {
                tenant_id: tenant_id.clone(),
                document_id: document_id.clone(),
                task_type: task_type.clone(),
            }),
            Self::LoadModule { .. } => None,
        }
    }
}

/// Failure information delivered through an acknowledgment callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NackInfo {
    /// The worker received the message and refused it
    Declined { reason: String },
    /// The transport could not reach the worker
    Undeliverable { reason: String },
}

/// What an acknowledgment callback receives: the ack payload or failure info
pub type AckReply = Result<serde_json::Value, NackInfo>;

/// Outcome of a request that did not end in a positive acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("No acknowledgment within {timeout:?}")]
    AckTimeout { timeout: Duration },

    #[error("Worker declined: {0}")]
    NegativeAck(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

impl From<NackInfo> for AckError {
    fn from(nack: NackInfo) -> Self {
        match nack {
            NackInfo::Declined { reason } => Self::NegativeAck(reason),
            NackInfo::Undeliverable { reason } => Self::Delivery(reason),
        }
    }
}
