//! Foreman implementation

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::ForemanConfig;
use super::outcome::{BroadcastReport, RevokeOutcome, RevokeStatus, SweepSummary};
use crate::domain::{AssignmentKey, ClientId, Worker, WorkerKind};
use crate::state::StateManager;
use crate::transport::{AckError, WorkerMessage, WorkerTransport, request};

/// Schedules revocation of expired work and pushes module updates to workers
pub struct Foreman {
    config: ForemanConfig,
    state: Arc<StateManager>,
    transport: Arc<dyn WorkerTransport>,
}

impl Foreman {
    pub fn new(config: ForemanConfig, state: Arc<StateManager>, transport: Arc<dyn WorkerTransport>) -> Self {
        debug!(?config, "Foreman::new: called");
        Self {
            config,
            state,
            transport,
        }
    }

    /// Read access to the StateManager for diagnostics
    pub fn manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    /// Revoke every assignment of every document that has expired at `now`
    ///
    /// All revokes run concurrently and the call returns once each has been
    /// acknowledged, declined or timed out. One failure never cancels the others.
    pub async fn revoke_expired_work(&self, now: Instant) -> Vec<RevokeOutcome> {
        debug!("Foreman::revoke_expired_work: called");
        let expired = self.state.get_expired_documents(now);
        if expired.is_empty() {
            debug!("Foreman::revoke_expired_work: nothing expired");
            return Vec::new();
        }

        let mut revokes = Vec::new();
        for document in &expired {
            debug!(
                tenant_id = %document.tenant_id,
                document_id = %document.document_id,
                tasks = document.assignments.len(),
                "Foreman::revoke_expired_work: document expired"
            );
            for (key, (_, worker)) in document.keys().zip(&document.assignments) {
                revokes.push(self.revoke(key, worker));
            }
        }

        info!(documents = expired.len(), assignments = revokes.len(), "Revoking expired work");
        join_all(revokes).await
    }

    async fn revoke(&self, key: AssignmentKey, worker: &Worker) -> RevokeOutcome {
        let client_id = worker.client_id().clone();
        debug!(%key, %client_id, "Foreman::revoke: called");

        let message = WorkerMessage::revoke(&key);
        let reply = request(self.transport.as_ref(), &worker.handle, message, self.config.ack_timeout()).await;
        let status = match reply {
            Ok(_) => self.on_revoke_ack(&key, &client_id),
            Err(error) => self.on_revoke_failure(&key, &client_id, error),
        };

        RevokeOutcome { key, client_id, status }
    }

    fn on_revoke_ack(&self, key: &AssignmentKey, client_id: &ClientId) -> RevokeStatus {
        match self.state.release_assignment(key, client_id) {
            Ok(true) => {
                info!(%key, %client_id, "Revoke acknowledged, assignment released");
                RevokeStatus::Revoked
            }
            Ok(false) => {
                debug!(%key, %client_id, "Foreman::on_revoke_ack: already released");
                RevokeStatus::AlreadyReleased
            }
            Err(e) => {
                debug!(%key, %client_id, error = %e, "Foreman::on_revoke_ack: slot reassigned before ack");
                RevokeStatus::AlreadyReleased
            }
        }
    }

    fn on_revoke_failure(&self, key: &AssignmentKey, client_id: &ClientId, error: AckError) -> RevokeStatus {
        error!(%key, %client_id, %error, "Revoke failed, assignment left in place");
        let Some(failures) = self.state.record_revoke_failure(key, client_id) else {
            debug!(%key, %client_id, "Foreman::on_revoke_failure: holder changed while waiting");
            return RevokeStatus::Failed { error, failures: 0 };
        };

        let limit = self.config.max_revoke_failures;
        if limit > 0 && failures >= limit && self.state.evict_assignment(key, client_id) {
            warn!(%key, %client_id, failures, "Revoke failure limit reached, assignment evicted");
            return RevokeStatus::ForceEvicted { error, failures };
        }
        RevokeStatus::Failed { error, failures }
    }

    /// Ask every worker of `kind` to load or activate `module_name`
    ///
    /// Best effort: declines and timeouts are logged and counted, never retried.
    pub async fn broadcast_new_agent_module(&self, module_name: &str, kind: WorkerKind, action: &str) -> BroadcastReport {
        debug!(%module_name, %kind, %action, "Foreman::broadcast_new_agent_module: called");
        let workers = self.state.get_active_workers(kind);
        info!(%module_name, %kind, %action, workers = workers.len(), "Broadcasting agent module");

        let sends = workers.iter().map(|worker| async move {
            let message = WorkerMessage::load_module(module_name, action);
            let reply = request(self.transport.as_ref(), &worker.handle, message, self.config.ack_timeout()).await;
            (worker, reply)
        });

        let mut report = BroadcastReport {
            workers: workers.len(),
            ..Default::default()
        };
        for (worker, reply) in join_all(sends).await {
            let client_id = worker.client_id();
            match reply {
                Ok(_) => {
                    info!(%client_id, %module_name, "Module broadcast acknowledged");
                    report.acked += 1;
                }
                Err(error @ AckError::AckTimeout { .. }) => {
                    warn!(%client_id, %module_name, %error, "Module broadcast not acknowledged");
                    report.timed_out += 1;
                }
                Err(error) => {
                    warn!(%client_id, %module_name, %error, "Module broadcast declined");
                    report.nacked += 1;
                }
            }
        }
        report
    }

    /// Run one sweep against the current time
    pub async fn sweep(&self) -> SweepSummary {
        let outcomes = self.revoke_expired_work(Instant::now()).await;
        let summary = SweepSummary::from_outcomes(&outcomes);
        if summary.is_empty() {
            debug!("Foreman::sweep: nothing to revoke");
        } else {
            info!(
                revoked = summary.revoked,
                already_released = summary.already_released,
                failed = summary.failed,
                evicted = summary.evicted,
                "Sweep complete"
            );
        }
        summary
    }

    /// Sweep every `sweep-interval` until a shutdown signal arrives
    ///
    /// Each sweep runs as its own task so a sweep waiting on slow workers does
    /// not delay the next one.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval_ms = self.config.sweep_interval_ms, "Foreman started");
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeps = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let foreman = Arc::clone(&self);
                    sweeps.spawn(async move { foreman.sweep().await });
                }

                Some(result) = sweeps.join_next(), if !sweeps.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Sweep task failed");
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("run: shutdown signal received");
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        debug!(in_flight = sweeps.len(), "run: waiting for in-flight sweeps");
        while let Some(result) = sweeps.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Sweep task failed");
            }
        }
        info!("Foreman stopped");
    }
}
