//! Foreman configuration

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::TaskType;

/// Which liveness signal decides that an assignment has expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Only the assignment's own `last_activity_at` counts
    Document,
    /// Only the holding worker's heartbeat counts
    Worker,
    /// Whichever signal expires first
    #[default]
    Either,
}

impl std::fmt::Display for ExpiryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Worker => write!(f, "worker"),
            Self::Either => write!(f, "either"),
        }
    }
}

impl std::str::FromStr for ExpiryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document" => Ok(Self::Document),
            "worker" => Ok(Self::Worker),
            "either" => Ok(Self::Either),
            _ => Err(format!("Unknown expiry policy: {}", s)),
        }
    }
}

/// Timeouts and task set shared by the StateManager and the Foreman
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// A worker with no heartbeat for this long is stale
    #[serde(rename = "worker-timeout-ms", default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,

    /// An assignment with no activity for this long is idle
    #[serde(rename = "document-timeout-ms", default = "default_document_timeout_ms")]
    pub document_timeout_ms: u64,

    /// Max wait for a revoke or broadcast acknowledgment
    #[serde(rename = "ack-timeout-ms", default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Interval between sweeps when driven by `Foreman::run`
    #[serde(rename = "sweep-interval-ms", default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Task types the scheduler manages
    #[serde(rename = "task-types", default = "default_task_types")]
    pub task_types: Vec<TaskType>,

    #[serde(rename = "expiry-policy", default)]
    pub expiry_policy: ExpiryPolicy,

    /// Consecutive failed revokes before an assignment is force-evicted (0 = never)
    #[serde(rename = "max-revoke-failures", default = "default_max_revoke_failures")]
    pub max_revoke_failures: u32,

    /// Capacity of the state change broadcast channel
    #[serde(rename = "event-buffer", default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_worker_timeout_ms() -> u64 {
    debug!("default_worker_timeout_ms: called");
    60_000
}

fn default_document_timeout_ms() -> u64 {
    debug!("default_document_timeout_ms: called");
    300_000
}

fn default_ack_timeout_ms() -> u64 {
    debug!("default_ack_timeout_ms: called");
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    debug!("default_sweep_interval_ms: called");
    10_000
}

fn default_task_types() -> Vec<TaskType> {
    ["intel", "spell", "translation", "augmentation", "snapshot"]
        .into_iter()
        .map(TaskType::from)
        .collect()
}

fn default_max_revoke_failures() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    64
}

impl Default for ForemanConfig {
    fn default() -> Self {
        debug!("ForemanConfig::default: called");
        Self {
            worker_timeout_ms: default_worker_timeout_ms(),
            document_timeout_ms: default_document_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            task_types: default_task_types(),
            expiry_policy: ExpiryPolicy::default(),
            max_revoke_failures: default_max_revoke_failures(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ForemanConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn document_timeout(&self) -> Duration {
        Duration::from_millis(self.document_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        debug!(?self, "ForemanConfig::validate: called");
        for (name, value) in [
            ("worker-timeout-ms", self.worker_timeout_ms),
            ("document-timeout-ms", self.document_timeout_ms),
            ("ack-timeout-ms", self.ack_timeout_ms),
            ("sweep-interval-ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(eyre!("{} must be greater than zero", name));
            }
        }
        if self.task_types.is_empty() {
            return Err(eyre!("task-types must name at least one task type"));
        }
        if self.event_buffer == 0 {
            return Err(eyre!("event-buffer must be greater than zero"));
        }
        Ok(())
    }
}
