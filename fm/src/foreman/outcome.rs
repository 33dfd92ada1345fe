//! Result types for sweeps and broadcasts

use serde::Serialize;

use crate::domain::{AssignmentKey, ClientId};
use crate::transport::AckError;

/// What happened to one assignment during a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeStatus {
    /// Worker acknowledged; the slot is free
    Revoked,
    /// Worker acknowledged, but the slot had already been freed or reassigned
    AlreadyReleased,
    /// No positive acknowledgment; the assignment stays in place
    Failed { error: AckError, failures: u32 },
    /// No positive acknowledgment, and the failure limit was reached so the slot was freed anyway
    ForceEvicted { error: AckError, failures: u32 },
}

/// Outcome of revoking one assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeOutcome {
    pub key: AssignmentKey,
    pub client_id: ClientId,
    pub status: RevokeStatus,
}

impl RevokeOutcome {
    /// True when the worker positively acknowledged the revoke
    pub fn is_acknowledged(&self) -> bool {
        matches!(self.status, RevokeStatus::Revoked | RevokeStatus::AlreadyReleased)
    }

    pub fn error(&self) -> Option<&AckError> {
        match &self.status {
            RevokeStatus::Failed { error, .. } | RevokeStatus::ForceEvicted { error, .. } => Some(error),
            RevokeStatus::Revoked | RevokeStatus::AlreadyReleased => None,
        }
    }
}

/// Counts for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub revoked: usize,
    pub already_released: usize,
    pub failed: usize,
    pub evicted: usize,
}

impl SweepSummary {
    pub fn from_outcomes(outcomes: &[RevokeOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut summary, outcome| {
            match outcome.status {
                RevokeStatus::Revoked => summary.revoked += 1,
                RevokeStatus::AlreadyReleased => summary.already_released += 1,
                RevokeStatus::Failed { .. } => summary.failed += 1,
                RevokeStatus::ForceEvicted { .. } => summary.evicted += 1,
            }
            summary
        })
    }

    pub fn total(&self) -> usize {
        self.revoked + self.already_released + self.failed + self.evicted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Acknowledgment tally for one module broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub workers: usize,
    pub acked: usize,
    pub nacked: usize,
    pub timed_out: usize,
}
