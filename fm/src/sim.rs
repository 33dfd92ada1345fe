//! In-process simulation of a worker pool
//!
//! Simulated workers connect through [`ChannelTransport`] and answer the Foreman
//! according to a fixed [`WorkerBehavior`]. Used by the `simulate`, `broadcast`
//! and `serve` commands and by integration tests.

use std::fmt;
use std::sync::Arc;

use eyre::{Result, eyre};
use rand::Rng;
use serde_json::json;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::domain::{AssignmentKey, WorkerDetail, WorkerKind};
use crate::foreman::{BroadcastReport, Foreman, ForemanConfig, SweepSummary};
use crate::state::{ManagerMetrics, StateManager};
use crate::transport::{ChannelTransport, Envelope, WorkerConnection, WorkerMessage};

/// How a simulated worker answers messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBehavior {
    /// Acknowledges everything
    Cooperative,
    /// Never answers
    Silent,
    /// Declines everything
    Declining,
}

impl fmt::Display for WorkerBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooperative => write!(f, "cooperative"),
            Self::Silent => write!(f, "silent"),
            Self::Declining => write!(f, "declining"),
        }
    }
}

/// Shape of a randomly generated pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub server_workers: usize,
    pub client_workers: usize,
    /// Probability that a worker is flaky (silent or declining)
    pub flaky: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            server_workers: 3,
            client_workers: 1,
            flaky: 0.0,
        }
    }
}

impl PoolConfig {
    fn pick_behavior(&self, rng: &mut impl Rng) -> WorkerBehavior {
        if !rng.random_bool(self.flaky.clamp(0.0, 1.0)) {
            return WorkerBehavior::Cooperative;
        }
        if rng.random_bool(0.5) {
            WorkerBehavior::Silent
        } else {
            WorkerBehavior::Declining
        }
    }
}

/// A worker task answering on its own connection
pub struct SimulatedWorker {
    pub detail: WorkerDetail,
    pub behavior: WorkerBehavior,
    task: JoinHandle<()>,
}

/// A Foreman wired to a pool of simulated workers
pub struct Simulation {
    foreman: Arc<Foreman>,
    transport: ChannelTransport,
    workers: Vec<SimulatedWorker>,
    next_document: usize,
}

impl Simulation {
    /// Build a random pool described by `pool`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ForemanConfig, pool: &PoolConfig) -> Result<Self> {
        debug!(?pool, "Simulation::start: called");
        config.validate()?;
        if !(0.0..=1.0).contains(&pool.flaky) {
            return Err(eyre!("flaky must be between 0.0 and 1.0, got {}", pool.flaky));
        }

        let mut rng = rand::rng();
        let mut workers = Vec::new();
        for (kind, count) in [
            (WorkerKind::Server, pool.server_workers),
            (WorkerKind::Client, pool.client_workers),
        ] {
            for n in 1..=count {
                let detail = WorkerDetail::new(format!("{}-{}", kind, n), kind);
                workers.push((detail, pool.pick_behavior(&mut rng)));
            }
        }
        Ok(Self::with_workers(config, workers))
    }

    /// Build a pool with fixed behaviors
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_workers(config: ForemanConfig, workers: Vec<(WorkerDetail, WorkerBehavior)>) -> Self {
        debug!(workers = workers.len(), "Simulation::with_workers: called");
        let state = Arc::new(StateManager::new(config.clone()));
        let transport = ChannelTransport::new(state.clone());
        let foreman = Arc::new(Foreman::new(config, state, Arc::new(transport.clone())));

        let workers = workers
            .into_iter()
            .map(|(detail, behavior)| {
                let conn = transport.connect(detail.clone());
                SimulatedWorker {
                    detail,
                    behavior,
                    task: tokio::spawn(serve_worker(conn, behavior)),
                }
            })
            .collect();

        Self {
            foreman,
            transport,
            workers,
            next_document: 0,
        }
    }

    pub fn foreman(&self) -> &Arc<Foreman> {
        &self.foreman
    }

    pub fn workers(&self) -> &[SimulatedWorker] {
        &self.workers
    }

    pub fn connected(&self) -> usize {
        self.transport.connected()
    }

    /// Open `documents` new documents and bind every configured task type for each
    ///
    /// Tasks are spread round-robin over all workers. Returns the number of
    /// assignments created.
    pub fn assign_documents(&mut self, tenant: &str, documents: usize) -> Result<usize> {
        debug!(%tenant, documents, "Simulation::assign_documents: called");
        if self.workers.is_empty() {
            return Err(eyre!("no workers to assign documents to"));
        }

        let state = self.foreman.manager();
        let task_types = state.config().task_types.clone();
        let mut bound = 0;
        for _ in 0..documents {
            self.next_document += 1;
            let document = format!("doc-{}", self.next_document);
            for task_type in &task_types {
                let worker = &self.workers[bound % self.workers.len()];
                let key = AssignmentKey::new(tenant, document.as_str(), task_type.clone());
                state.bind_assignment(key, &worker.detail)?;
                bound += 1;
            }
        }
        info!(%tenant, documents, assignments = bound, "Documents assigned");
        Ok(bound)
    }

    /// A point far enough ahead that every current assignment has expired
    /// under any expiry policy
    pub fn expiry_horizon(&self) -> Instant {
        let config = self.foreman.config();
        Instant::now() + config.document_timeout().max(config.worker_timeout()) + std::time::Duration::from_millis(1)
    }

    /// Run `count` sweeps as if every document had gone idle
    pub async fn run_sweeps(&self, count: usize) -> Vec<SweepSummary> {
        debug!(count, "Simulation::run_sweeps: called");
        let mut summaries = Vec::with_capacity(count);
        for sweep in 1..=count {
            let outcomes = self.foreman.revoke_expired_work(self.expiry_horizon()).await;
            let summary = SweepSummary::from_outcomes(&outcomes);
            debug!(sweep, ?summary, "Simulation::run_sweeps: sweep done");
            summaries.push(summary);
        }
        summaries
    }

    pub async fn broadcast(&self, module_name: &str, kind: WorkerKind, action: &str) -> BroadcastReport {
        self.foreman.broadcast_new_agent_module(module_name, kind, action).await
    }

    pub fn metrics(&self) -> ManagerMetrics {
        self.foreman.manager().metrics()
    }

    /// Disconnect every worker and return the final state counters
    pub async fn shutdown(self) -> ManagerMetrics {
        debug!("Simulation::shutdown: called");
        for worker in &self.workers {
            worker.task.abort();
        }
        for worker in self.workers {
            // Aborted tasks drop their connection, which unregisters the worker
            worker_failed(&worker.detail, worker.task.await);
        }
        let metrics = self.foreman.manager().metrics();
        info!(?metrics, "Simulation stopped");
        metrics
    }
}

/// Log a worker task that ended other than by cancellation; returns true if it did
fn worker_failed(detail: &WorkerDetail, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => false,
        Err(e) if e.is_cancelled() => false,
        Err(e) => {
            error!(client_id = %detail.client_id, error = %e, "Simulated worker failed");
            true
        }
    }
}

async fn serve_worker(mut conn: WorkerConnection, behavior: WorkerBehavior) {
    let client_id = conn.detail().client_id.clone();
    let mut held: Vec<Envelope> = Vec::new();
    while let Some(envelope) = conn.recv().await {
        debug!(%client_id, %behavior, message = envelope.message().name(), "serve_worker: received");
        match behavior {
            WorkerBehavior::Cooperative => {
                let payload = match envelope.message() {
                    WorkerMessage::Revoke { .. } => json!({"released": true}),
                    WorkerMessage::LoadModule { module_name, .. } => json!({"loaded": module_name}),
                };
                envelope.ack(payload);
            }
            WorkerBehavior::Declining => envelope.nack("declined by simulated worker"),
            WorkerBehavior::Silent => held.push(envelope),
        }
    }
}
