//! Connected worker processes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::ids::ClientId;

/// Class of worker, used as the bucket for broadcasts and registry queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Server,
    Client,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            _ => Err(format!("Unknown worker kind: {}", s)),
        }
    }
}

/// Identity a worker presents when it connects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerDetail {
    #[serde(rename = "client-id")]
    pub client_id: ClientId,
    pub kind: WorkerKind,
}

impl WorkerDetail {
    pub fn new(client_id: impl Into<ClientId>, kind: WorkerKind) -> Self {
        Self {
            client_id: client_id.into(),
            kind,
        }
    }
}

/// Handle the transport uses to route messages to one worker connection
///
/// The transport owns the connection; the scheduler only keeps this copyable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A registered worker
#[derive(Debug, Clone)]
pub struct Worker {
    pub detail: WorkerDetail,
    pub handle: TransportHandle,
    /// Wall-clock registration time, for display
    pub connected_at: DateTime<Utc>,
    /// Last liveness signal (registration or heartbeat)
    pub last_heartbeat_at: Instant,
}

impl Worker {
    pub fn new(detail: WorkerDetail, handle: TransportHandle) -> Self {
        Self {
            detail,
            handle,
            connected_at: Utc::now(),
            last_heartbeat_at: Instant::now(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.detail.client_id
    }

    pub fn kind(&self) -> WorkerKind {
        self.detail.kind
    }

    /// True when no heartbeat has been seen for longer than `timeout`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat_at) > timeout
    }
}
