//! StateManager - registry of workers and the assignments bound to them
//!
//! All operations are synchronous and serialize on one mutex over both tables.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{
    Assignment, AssignmentKey, ClientId, DocumentId, ExpiredDocument, TaskType, TenantId, TransportHandle, Worker,
    WorkerDetail, WorkerKind,
};
use crate::foreman::{ExpiryPolicy, ForemanConfig};

use super::messages::{StateError, StateEvent, StateResponse};

/// Aggregated counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerMetrics {
    /// Registered server-class workers
    pub server_workers: usize,
    /// Registered client-class workers
    pub client_workers: usize,
    /// Live assignments
    pub assignments: usize,
    /// New assignments created since startup
    pub total_binds: u64,
    /// Assignments removed (release, revoke, disconnect or eviction)
    pub total_removals: u64,
    /// Assignments removed by forced eviction
    pub total_evictions: u64,
}

#[derive(Default)]
struct StateInner {
    workers: HashMap<ClientId, Worker>,
    assignments: HashMap<AssignmentKey, Assignment>,
    /// Secondary index so a disconnect can reap a worker's assignments directly
    by_worker: HashMap<ClientId, HashSet<AssignmentKey>>,
    total_binds: u64,
    total_removals: u64,
    total_evictions: u64,
}

impl StateInner {
    fn insert(&mut self, assignment: Assignment) {
        self.by_worker
            .entry(assignment.client_id.clone())
            .or_default()
            .insert(assignment.key.clone());
        self.assignments.insert(assignment.key.clone(), assignment);
    }

    fn take(&mut self, key: &AssignmentKey) -> Option<Assignment> {
        let assignment = self.assignments.remove(key)?;
        if let Some(keys) = self.by_worker.get_mut(&assignment.client_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_worker.remove(&assignment.client_id);
            }
        }
        self.total_removals += 1;
        Some(assignment)
    }

    fn holder(&self, key: &AssignmentKey) -> Option<ClientId> {
        self.assignments.get(key).map(|a| a.client_id.clone())
    }

    /// Returns false if the worker is not registered
    fn heartbeat(&mut self, client_id: &ClientId, now: Instant) -> bool {
        match self.workers.get_mut(client_id) {
            Some(worker) => {
                worker.last_heartbeat_at = now.max(worker.last_heartbeat_at);
                true
            }
            None => false,
        }
    }
}

/// Owns the worker registry and the assignment table
pub struct StateManager {
    config: ForemanConfig,
    task_types: HashSet<TaskType>,
    inner: Mutex<StateInner>,
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateManager {
    pub fn new(config: ForemanConfig) -> Self {
        debug!(?config, "StateManager::new: called");
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            task_types: config.task_types.iter().cloned().collect(),
            config,
            inner: Mutex::new(StateInner::default()),
            event_tx,
        }
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    /// Subscribe to registry and assignment changes
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // A panic while holding the lock cannot leave the tables half-updated:
        // every mutation completes before the guard is released.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a change; callers hold the state lock so events follow mutation order
    fn emit(&self, event: StateEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("StateManager::emit: no subscribers");
        }
    }

    // === Worker registry ===

    /// Insert or replace the worker entry for `detail.client_id`
    pub fn register_worker(&self, detail: WorkerDetail, handle: TransportHandle) {
        debug!(client_id = %detail.client_id, kind = %detail.kind, %handle, "StateManager::register_worker: called");
        let worker = Worker::new(detail.clone(), handle);
        let mut inner = self.lock();
        let replaced = inner.workers.insert(detail.client_id.clone(), worker).is_some();
        if replaced {
            debug!(client_id = %detail.client_id, "StateManager::register_worker: replaced existing entry");
        } else {
            info!(client_id = %detail.client_id, kind = %detail.kind, "Worker registered");
        }
        self.emit(StateEvent::WorkerRegistered {
            client_id: detail.client_id,
            kind: detail.kind,
        });
    }

    /// Remove a worker and every assignment bound to it
    ///
    /// Unknown ids are a no-op and return an empty list.
    pub fn unregister_worker(&self, client_id: &ClientId) -> Vec<Assignment> {
        debug!(%client_id, "StateManager::unregister_worker: called");
        let mut inner = self.lock();
        self.unregister_locked(&mut inner, client_id).unwrap_or_default()
    }

    /// Unregister `client_id` only while `handle` is still its registered connection
    ///
    /// Returns None, and changes nothing, when the worker is unknown or has since
    /// reconnected under another handle.
    pub fn unregister_worker_if(&self, client_id: &ClientId, handle: TransportHandle) -> Option<Vec<Assignment>> {
        debug!(%client_id, %handle, "StateManager::unregister_worker_if: called");
        let mut inner = self.lock();
        if inner.workers.get(client_id).map(|w| w.handle) != Some(handle) {
            debug!(%client_id, %handle, "StateManager::unregister_worker_if: superseded or unknown");
            return None;
        }
        self.unregister_locked(&mut inner, client_id)
    }

    fn unregister_locked(&self, inner: &mut StateInner, client_id: &ClientId) -> Option<Vec<Assignment>> {
        if inner.workers.remove(client_id).is_none() {
            debug!(%client_id, "StateManager::unregister_locked: not registered");
            return None;
        }
        let keys = inner.by_worker.remove(client_id).unwrap_or_default();
        let mut removed: Vec<Assignment> = keys.iter().filter_map(|key| inner.take(key)).collect();
        removed.sort_by(|a, b| a.key.cmp(&b.key));

        info!(%client_id, assignments = removed.len(), "Worker unregistered");
        for assignment in &removed {
            self.emit(StateEvent::AssignmentRemoved {
                key: assignment.key.clone(),
                client_id: client_id.clone(),
            });
        }
        self.emit(StateEvent::WorkerUnregistered {
            client_id: client_id.clone(),
            assignments: removed.len(),
        });
        Some(removed)
    }

    /// Record a worker-level liveness signal
    pub fn heartbeat_worker(&self, client_id: &ClientId) -> StateResponse<()> {
        debug!(%client_id, "StateManager::heartbeat_worker: called");
        let now = Instant::now();
        if !self.lock().heartbeat(client_id, now) {
            return Err(StateError::UnknownWorker(client_id.clone()));
        }
        Ok(())
    }

    pub fn get_worker(&self, client_id: &ClientId) -> Option<Worker> {
        self.lock().workers.get(client_id).cloned()
    }

    /// All registered workers of `kind`, ordered by client id
    pub fn get_active_workers(&self, kind: WorkerKind) -> Vec<Worker> {
        debug!(%kind, "StateManager::get_active_workers: called");
        let mut workers: Vec<Worker> = self
            .lock()
            .workers
            .values()
            .filter(|w| w.kind() == kind)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.client_id().cmp(b.client_id()));
        workers
    }

    // === Assignment table ===

    /// Bind `key` to `worker`, or refresh it if `worker` already holds it
    ///
    /// A refresh by the holder also counts as a heartbeat from that worker.
    pub fn bind_assignment(&self, key: AssignmentKey, worker: &WorkerDetail) -> StateResponse<Assignment> {
        debug!(%key, client_id = %worker.client_id, "StateManager::bind_assignment: called");
        if !self.task_types.contains(&key.task_type) {
            return Err(StateError::UnknownTaskType(key.task_type));
        }

        let now = Instant::now();
        let mut inner = self.lock();
        if !inner.workers.contains_key(&worker.client_id) {
            return Err(StateError::UnknownWorker(worker.client_id.clone()));
        }

        if let Some(existing) = inner.assignments.get_mut(&key) {
            if existing.client_id != worker.client_id {
                debug!(%key, holder = %existing.client_id, "StateManager::bind_assignment: held by another worker");
                return Err(StateError::AlreadyAssigned {
                    key,
                    holder: existing.client_id.clone(),
                });
            }
            debug!(%key, "StateManager::bind_assignment: same holder, refreshing");
            existing.touch(now);
            let refreshed = existing.clone();
            inner.heartbeat(&worker.client_id, now);
            return Ok(refreshed);
        }

        let assignment = Assignment::new(key.clone(), worker.client_id.clone(), now);
        inner.insert(assignment.clone());
        inner.total_binds += 1;

        info!(%key, client_id = %worker.client_id, "Assignment bound");
        self.emit(StateEvent::AssignmentBound {
            key,
            client_id: worker.client_id.clone(),
        });
        Ok(assignment)
    }

    /// Heartbeat for one assignment; also refreshes the holding worker's liveness
    pub fn refresh_assignment(&self, key: &AssignmentKey) -> StateResponse<()> {
        debug!(%key, "StateManager::refresh_assignment: called");
        let now = Instant::now();
        let mut inner = self.lock();
        let assignment = inner
            .assignments
            .get_mut(key)
            .ok_or_else(|| StateError::NotAssigned(key.clone()))?;
        assignment.touch(now);
        let holder = assignment.client_id.clone();
        inner.heartbeat(&holder, now);
        Ok(())
    }

    /// Remove an assignment regardless of holder; returns whether one existed
    pub fn remove_assignment(&self, key: &AssignmentKey) -> bool {
        debug!(%key, "StateManager::remove_assignment: called");
        let mut inner = self.lock();
        match inner.take(key) {
            Some(assignment) => {
                info!(%key, client_id = %assignment.client_id, "Assignment removed");
                self.emit(StateEvent::AssignmentRemoved {
                    key: key.clone(),
                    client_id: assignment.client_id,
                });
                true
            }
            None => {
                debug!(%key, "StateManager::remove_assignment: already gone");
                false
            }
        }
    }

    /// Remove an assignment only if `client_id` still holds it
    ///
    /// Returns `Ok(false)` when the key is free and `AlreadyAssigned` when another
    /// worker has since taken it.
    pub fn release_assignment(&self, key: &AssignmentKey, client_id: &ClientId) -> StateResponse<bool> {
        debug!(%key, %client_id, "StateManager::release_assignment: called");
        let mut inner = self.lock();
        match inner.holder(key) {
            None => Ok(false),
            Some(holder) if &holder != client_id => Err(StateError::AlreadyAssigned {
                key: key.clone(),
                holder,
            }),
            Some(_) => {
                inner.take(key);
                info!(%key, %client_id, "Assignment released");
                self.emit(StateEvent::AssignmentRemoved {
                    key: key.clone(),
                    client_id: client_id.clone(),
                });
                Ok(true)
            }
        }
    }

    /// Count a failed revoke against the assignment `client_id` holds
    ///
    /// Returns the new consecutive failure count, or None if the holder changed.
    pub fn record_revoke_failure(&self, key: &AssignmentKey, client_id: &ClientId) -> Option<u32> {
        debug!(%key, %client_id, "StateManager::record_revoke_failure: called");
        let mut inner = self.lock();
        let assignment = inner.assignments.get_mut(key).filter(|a| &a.client_id == client_id)?;
        assignment.revoke_failures += 1;
        Some(assignment.revoke_failures)
    }

    /// Remove an assignment without the holder's acknowledgment
    pub fn evict_assignment(&self, key: &AssignmentKey, client_id: &ClientId) -> bool {
        debug!(%key, %client_id, "StateManager::evict_assignment: called");
        let mut inner = self.lock();
        if inner.holder(key).as_ref() != Some(client_id) {
            return false;
        }
        let Some(assignment) = inner.take(key) else {
            return false;
        };
        inner.total_evictions += 1;

        warn!(%key, %client_id, failures = assignment.revoke_failures, "Assignment force-evicted");
        self.emit(StateEvent::AssignmentEvicted {
            key: key.clone(),
            client_id: client_id.clone(),
            failures: assignment.revoke_failures,
        });
        true
    }

    pub fn get_assignment(&self, key: &AssignmentKey) -> Option<Assignment> {
        self.lock().assignments.get(key).cloned()
    }

    /// Snapshot of every live assignment, ordered by key
    pub fn assignments(&self) -> Vec<Assignment> {
        let mut assignments: Vec<Assignment> = self.lock().assignments.values().cloned().collect();
        assignments.sort_by(|a, b| a.key.cmp(&b.key));
        assignments
    }

    pub fn get_assignments_for_document(&self, tenant_id: &TenantId, document_id: &DocumentId) -> Vec<Assignment> {
        let mut assignments: Vec<Assignment> = self
            .lock()
            .assignments
            .values()
            .filter(|a| a.key.same_document(tenant_id, document_id))
            .cloned()
            .collect();
        assignments.sort_by(|a, b| a.key.cmp(&b.key));
        assignments
    }

    pub fn get_assignments_for_worker(&self, client_id: &ClientId) -> Vec<AssignmentKey> {
        let mut keys: Vec<AssignmentKey> = self
            .lock()
            .by_worker
            .get(client_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn is_expired(&self, assignment: &Assignment, worker: &Worker, now: Instant) -> bool {
        let idle = assignment.is_idle(now, self.config.document_timeout());
        let stale = worker.is_stale(now, self.config.worker_timeout());
        match self.config.expiry_policy {
            ExpiryPolicy::Document => idle,
            ExpiryPolicy::Worker => stale,
            ExpiryPolicy::Either => idle || stale,
        }
    }

    /// Documents with at least one expired assignment
    ///
    /// Each entry carries every current assignment of that document, so the caller
    /// can revoke the whole document's task set together.
    pub fn get_expired_documents(&self, now: Instant) -> Vec<ExpiredDocument> {
        debug!("StateManager::get_expired_documents: called");
        let inner = self.lock();
        let mut documents: BTreeMap<(TenantId, DocumentId), (bool, Vec<(TaskType, Worker)>)> = BTreeMap::new();

        for assignment in inner.assignments.values() {
            let Some(worker) = inner.workers.get(&assignment.client_id) else {
                warn!(key = %assignment.key, client_id = %assignment.client_id, "Assignment held by unregistered worker");
                continue;
            };
            let expired = self.is_expired(assignment, worker, now);
            let entry = documents
                .entry((assignment.key.tenant_id.clone(), assignment.key.document_id.clone()))
                .or_default();
            entry.0 |= expired;
            entry.1.push((assignment.key.task_type.clone(), worker.clone()));
        }
        drop(inner);

        let expired: Vec<ExpiredDocument> = documents
            .into_iter()
            .filter(|(_, (expired, _))| *expired)
            .map(|((tenant_id, document_id), (_, mut assignments))| {
                assignments.sort_by(|a, b| a.0.cmp(&b.0));
                ExpiredDocument {
                    tenant_id,
                    document_id,
                    assignments,
                }
            })
            .collect();

        debug!(count = expired.len(), "StateManager::get_expired_documents: returning");
        expired
    }

    pub fn metrics(&self) -> ManagerMetrics {
        let inner = self.lock();
        let server_workers = inner.workers.values().filter(|w| w.kind() == WorkerKind::Server).count();
        ManagerMetrics {
            server_workers,
            client_workers: inner.workers.len() - server_workers,
            assignments: inner.assignments.len(),
            total_binds: inner.total_binds,
            total_removals: inner.total_removals,
            total_evictions: inner.total_evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn test_config() -> ForemanConfig {
        ForemanConfig {
            document_timeout_ms: 30_000,
            worker_timeout_ms: 60_000,
            ..Default::default()
        }
    }

    fn register(manager: &StateManager, id: &str, kind: WorkerKind, handle: u64) -> WorkerDetail {
        let detail = WorkerDetail::new(id, kind);
        manager.register_worker(detail.clone(), TransportHandle::new(handle));
        detail
    }

    #[test]
    fn test_register_is_idempotent() {
        let manager = StateManager::new(test_config());
        register(&manager, "w1", WorkerKind::Server, 1);
        register(&manager, "w1", WorkerKind::Server, 2);

        let workers = manager.get_active_workers(WorkerKind::Server);
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].handle, TransportHandle::new(2));
    }

    #[test]
    fn test_active_workers_filtered_by_kind() {
        let manager = StateManager::new(test_config());
        register(&manager, "s2", WorkerKind::Server, 1);
        register(&manager, "c1", WorkerKind::Client, 2);
        register(&manager, "s1", WorkerKind::Server, 3);

        let servers: Vec<String> = manager
            .get_active_workers(WorkerKind::Server)
            .iter()
            .map(|w| w.client_id().to_string())
            .collect();
        assert_eq!(servers, vec!["s1", "s2"]);
        assert_eq!(manager.get_active_workers(WorkerKind::Client).len(), 1);
    }

    #[test]
    fn test_second_bind_to_other_worker_fails() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let w2 = register(&manager, "w2", WorkerKind::Server, 2);
        let key = AssignmentKey::new("tenantA", "doc1", "intel");

        manager.bind_assignment(key.clone(), &w1).unwrap();
        let err = manager.bind_assignment(key.clone(), &w2).unwrap_err();
        assert_eq!(
            err,
            StateError::AlreadyAssigned {
                key: key.clone(),
                holder: ClientId::new("w1"),
            }
        );
        assert_eq!(manager.get_assignment(&key).unwrap().client_id, ClientId::new("w1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_by_holder_refreshes() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let key = AssignmentKey::new("tenantA", "doc1", "intel");

        let first = manager.bind_assignment(key.clone(), &w1).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = manager.bind_assignment(key.clone(), &w1).unwrap();

        assert_eq!(second.assigned_at, first.assigned_at);
        assert_eq!(second.last_activity_at, first.assigned_at + Duration::from_secs(10));
        assert_eq!(manager.metrics().total_binds, 1);
    }

    #[test]
    fn test_bind_requires_registered_worker_and_known_task() {
        let manager = StateManager::new(test_config());
        let ghost = WorkerDetail::new("ghost", WorkerKind::Server);
        let err = manager
            .bind_assignment(AssignmentKey::new("t", "d", "intel"), &ghost)
            .unwrap_err();
        assert_eq!(err, StateError::UnknownWorker(ClientId::new("ghost")));

        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let err = manager
            .bind_assignment(AssignmentKey::new("t", "d", "juggling"), &w1)
            .unwrap_err();
        assert_eq!(err, StateError::UnknownTaskType(TaskType::from("juggling")));
    }

    #[test]
    fn test_refresh_missing_key_fails() {
        let manager = StateManager::new(test_config());
        let key = AssignmentKey::new("t", "d", "intel");
        assert_eq!(manager.refresh_assignment(&key), Err(StateError::NotAssigned(key)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let manager = StateManager::new(ForemanConfig {
            expiry_policy: ExpiryPolicy::Document,
            ..test_config()
        });
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        manager
            .bind_assignment(AssignmentKey::new("tenantA", "doc1", "intel"), &w1)
            .unwrap();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(30);

        assert!(manager.get_expired_documents(t0 + timeout).is_empty());

        let expired = manager.get_expired_documents(t0 + timeout + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tenant_id, TenantId::new("tenantA"));
        assert_eq!(expired[0].document_id, DocumentId::new("doc1"));
        assert_eq!(expired[0].assignments.len(), 1);
        assert_eq!(expired[0].assignments[0].0, TaskType::from("intel"));
        assert_eq!(expired[0].assignments[0].1.client_id(), &ClientId::new("w1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_postpones_expiry() {
        let manager = StateManager::new(ForemanConfig {
            expiry_policy: ExpiryPolicy::Document,
            ..test_config()
        });
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let key = AssignmentKey::new("tenantA", "doc1", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        manager.refresh_assignment(&key).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(manager.get_expired_documents(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_document_lists_all_tasks() {
        let manager = StateManager::new(ForemanConfig {
            expiry_policy: ExpiryPolicy::Document,
            ..test_config()
        });
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let w2 = register(&manager, "w2", WorkerKind::Server, 2);
        let spell = AssignmentKey::new("tenantA", "doc1", "spell");
        manager
            .bind_assignment(AssignmentKey::new("tenantA", "doc1", "intel"), &w1)
            .unwrap();
        manager.bind_assignment(spell.clone(), &w2).unwrap();
        manager
            .bind_assignment(AssignmentKey::new("tenantA", "doc2", "intel"), &w1)
            .unwrap();

        tokio::time::advance(Duration::from_secs(25)).await;
        // Only doc1/spell stays fresh; doc1 still expires through intel
        manager.refresh_assignment(&spell).unwrap();
        manager
            .refresh_assignment(&AssignmentKey::new("tenantA", "doc2", "intel"))
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let expired = manager.get_expired_documents(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].document_id, DocumentId::new("doc1"));
        let tasks: Vec<&str> = expired[0].assignments.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tasks, vec!["intel", "spell"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_policy_uses_heartbeat() {
        let manager = StateManager::new(ForemanConfig {
            expiry_policy: ExpiryPolicy::Worker,
            worker_timeout_ms: 5_000,
            ..test_config()
        });
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let w2 = register(&manager, "w2", WorkerKind::Server, 2);
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "intel"), &w1).unwrap();
        manager.bind_assignment(AssignmentKey::new("t", "doc2", "intel"), &w2).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        manager.heartbeat_worker(&w2.client_id).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = manager.get_expired_documents(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].document_id, DocumentId::new("doc1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_either_policy_takes_earlier_expiry() {
        let manager = StateManager::new(ForemanConfig {
            expiry_policy: ExpiryPolicy::Either,
            worker_timeout_ms: 5_000,
            document_timeout_ms: 60_000,
            ..test_config()
        });
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "intel"), &w1).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.get_expired_documents(Instant::now()).len(), 1);

        manager.heartbeat_worker(&w1.client_id).unwrap();
        assert!(manager.get_expired_documents(Instant::now()).is_empty());
    }

    #[test]
    fn test_heartbeat_unknown_worker() {
        let manager = StateManager::new(test_config());
        let id = ClientId::new("nobody");
        assert_eq!(manager.heartbeat_worker(&id), Err(StateError::UnknownWorker(id)));
    }

    #[test]
    fn test_unregister_cascades_to_assignments() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let w2 = register(&manager, "w2", WorkerKind::Server, 2);
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "intel"), &w1).unwrap();
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "spell"), &w1).unwrap();
        manager.bind_assignment(AssignmentKey::new("t", "doc2", "intel"), &w2).unwrap();

        let removed = manager.unregister_worker(&w1.client_id);
        let keys: Vec<String> = removed.iter().map(|a| a.key.to_string()).collect();
        assert_eq!(keys, vec!["t/doc1/intel", "t/doc1/spell"]);

        assert!(manager.get_worker(&w1.client_id).is_none());
        assert!(manager.get_assignments_for_worker(&w1.client_id).is_empty());
        assert_eq!(manager.assignments().len(), 1);

        // w2's slot is untouched, w1's slots are free again
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "intel"), &w2).unwrap();
    }

    #[test]
    fn test_unregister_if_ignores_superseded_handle() {
        let manager = StateManager::new(test_config());
        register(&manager, "w1", WorkerKind::Server, 1);
        let w1 = register(&manager, "w1", WorkerKind::Server, 2);
        let key = AssignmentKey::new("t", "doc1", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();

        assert!(manager.unregister_worker_if(&w1.client_id, TransportHandle::new(1)).is_none());
        assert_eq!(manager.get_worker(&w1.client_id).unwrap().handle, TransportHandle::new(2));
        assert!(manager.get_assignment(&key).is_some());

        let removed = manager.unregister_worker_if(&w1.client_id, TransportHandle::new(2)).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(manager.unregister_worker_if(&w1.client_id, TransportHandle::new(2)).is_none());
    }

    #[test]
    fn test_assignments_for_document() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let w2 = register(&manager, "w2", WorkerKind::Client, 2);
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "spell"), &w2).unwrap();
        manager.bind_assignment(AssignmentKey::new("t", "doc1", "intel"), &w1).unwrap();
        manager.bind_assignment(AssignmentKey::new("t", "doc2", "intel"), &w1).unwrap();
        manager.bind_assignment(AssignmentKey::new("u", "doc1", "intel"), &w1).unwrap();

        let keys: Vec<String> = manager
            .get_assignments_for_document(&TenantId::new("t"), &DocumentId::new("doc1"))
            .iter()
            .map(|a| a.key.to_string())
            .collect();
        assert_eq!(keys, vec!["t/doc1/intel", "t/doc1/spell"]);

        assert!(
            manager
                .get_assignments_for_document(&TenantId::new("t"), &DocumentId::new("doc9"))
                .is_empty()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshed_assignment_keeps_worker_alive_with_default_config() {
        let manager = StateManager::new(ForemanConfig::default());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let key = AssignmentKey::new("tenantA", "doc1", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();

        // Past the 60s worker timeout, driven only by assignment refreshes
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(10)).await;
            manager.refresh_assignment(&key).unwrap();
        }
        assert!(manager.get_expired_documents(Instant::now()).is_empty());

        // A same-holder rebind counts as well
        tokio::time::advance(Duration::from_secs(50)).await;
        manager.bind_assignment(key.clone(), &w1).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(manager.get_expired_documents(Instant::now()).is_empty());

        // Silence past the worker timeout still expires it
        tokio::time::advance(Duration::from_secs(41)).await;
        assert_eq!(manager.get_expired_documents(Instant::now()).len(), 1);
    }

    #[test]
    fn test_events_follow_mutation_order_across_threads() {
        use tokio::sync::broadcast::error::TryRecvError;

        let manager = StateManager::new(ForemanConfig {
            event_buffer: 1 << 16,
            ..test_config()
        });
        let mut events = manager.subscribe_events();
        let shared = WorkerDetail::new("shared", WorkerKind::Server);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..200 {
                    manager.register_worker(shared.clone(), TransportHandle::new(round));
                    manager.unregister_worker(&shared.client_id);
                }
            });
            for t in 0..3 {
                let manager = &manager;
                let shared = &shared;
                scope.spawn(move || {
                    for n in 0..200 {
                        let key = AssignmentKey::new("t", format!("doc-{}-{}", t, n % 10), "intel");
                        if manager.bind_assignment(key.clone(), shared).is_ok() && n % 3 == 0 {
                            manager.remove_assignment(&key);
                        }
                    }
                });
            }
        });

        // Replaying the stream must never show a binding to an unregistered worker
        let mut registered: HashSet<ClientId> = HashSet::new();
        let mut bound: HashMap<AssignmentKey, ClientId> = HashMap::new();
        loop {
            match events.try_recv() {
                Ok(StateEvent::WorkerRegistered { client_id, .. }) => {
                    registered.insert(client_id);
                }
                Ok(StateEvent::WorkerUnregistered { client_id, .. }) => {
                    assert!(bound.values().all(|holder| holder != &client_id), "unregistered while bound");
                    registered.remove(&client_id);
                }
                Ok(StateEvent::AssignmentBound { key, client_id }) => {
                    assert!(registered.contains(&client_id), "bound to unregistered worker");
                    assert!(bound.insert(key, client_id).is_none());
                }
                Ok(StateEvent::AssignmentRemoved { key, client_id })
                | Ok(StateEvent::AssignmentEvicted { key, client_id, .. }) => {
                    assert_eq!(bound.remove(&key), Some(client_id));
                }
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("event stream broken: {}", e),
            }
        }

        assert!(registered.is_empty());
        assert!(bound.is_empty());
        assert!(manager.assignments().is_empty());
    }

    #[test]
    fn test_unregister_without_assignments_or_unknown() {
        let manager = StateManager::new(test_config());
        register(&manager, "w1", WorkerKind::Client, 1);
        assert!(manager.unregister_worker(&ClientId::new("w1")).is_empty());
        assert!(manager.unregister_worker(&ClientId::new("w1")).is_empty());
    }

    #[test]
    fn test_remove_assignment_reports_existence() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let key = AssignmentKey::new("t", "d", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();

        assert!(manager.remove_assignment(&key));
        assert!(!manager.remove_assignment(&key));
    }

    #[test]
    fn test_release_checks_holder() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let w2 = register(&manager, "w2", WorkerKind::Server, 2);
        let key = AssignmentKey::new("t", "d", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();

        assert!(matches!(
            manager.release_assignment(&key, &w2.client_id),
            Err(StateError::AlreadyAssigned { .. })
        ));
        assert_eq!(manager.release_assignment(&key, &w1.client_id), Ok(true));
        assert_eq!(manager.release_assignment(&key, &w1.client_id), Ok(false));
    }

    #[test]
    fn test_revoke_failures_and_eviction() {
        let manager = StateManager::new(test_config());
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let key = AssignmentKey::new("t", "d", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();

        assert_eq!(manager.record_revoke_failure(&key, &w1.client_id), Some(1));
        assert_eq!(manager.record_revoke_failure(&key, &w1.client_id), Some(2));
        assert_eq!(manager.record_revoke_failure(&key, &ClientId::new("w2")), None);

        assert!(!manager.evict_assignment(&key, &ClientId::new("w2")));
        assert!(manager.evict_assignment(&key, &w1.client_id));
        assert!(manager.get_assignment(&key).is_none());

        let metrics = manager.metrics();
        assert_eq!(metrics.total_evictions, 1);
        assert_eq!(metrics.total_removals, 1);
    }

    #[test]
    fn test_metrics_counts() {
        let manager = StateManager::new(test_config());
        let s1 = register(&manager, "s1", WorkerKind::Server, 1);
        register(&manager, "c1", WorkerKind::Client, 2);
        manager.bind_assignment(AssignmentKey::new("t", "d", "intel"), &s1).unwrap();

        assert_eq!(
            manager.metrics(),
            ManagerMetrics {
                server_workers: 1,
                client_workers: 1,
                assignments: 1,
                total_binds: 1,
                total_removals: 0,
                total_evictions: 0,
            }
        );
    }

    #[test]
    fn test_events_are_broadcast() {
        let manager = StateManager::new(test_config());
        let mut events = manager.subscribe_events();
        let w1 = register(&manager, "w1", WorkerKind::Server, 1);
        let key = AssignmentKey::new("t", "d", "intel");
        manager.bind_assignment(key.clone(), &w1).unwrap();
        manager.unregister_worker(&w1.client_id);

        assert!(matches!(events.try_recv(), Ok(StateEvent::WorkerRegistered { .. })));
        assert_eq!(
            events.try_recv().unwrap(),
            StateEvent::AssignmentBound {
                key: key.clone(),
                client_id: w1.client_id.clone(),
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            StateEvent::AssignmentRemoved {
                key,
                client_id: w1.client_id.clone(),
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            StateEvent::WorkerUnregistered {
                client_id: w1.client_id,
                assignments: 1,
            }
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Bind { doc: u8, task: u8, worker: u8 },
        Remove { doc: u8, task: u8 },
        Unregister { worker: u8 },
        Register { worker: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..3u8, 0..2u8, 0..3u8).prop_map(|(doc, task, worker)| Op::Bind { doc, task, worker }),
            1 => (0..3u8, 0..2u8).prop_map(|(doc, task)| Op::Remove { doc, task }),
            1 => (0..3u8).prop_map(|worker| Op::Unregister { worker }),
            1 => (0..3u8).prop_map(|worker| Op::Register { worker }),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_holder_per_key(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let manager = StateManager::new(test_config());
            let tasks = ["intel", "spell"];
            let worker = |i: u8| WorkerDetail::new(format!("w{}", i), WorkerKind::Server);
            let key = |doc: u8, task: u8| AssignmentKey::new("t", format!("doc{}", doc), tasks[task as usize]);

            let mut registered: HashSet<u8> = HashSet::new();
            let mut model: HashMap<AssignmentKey, u8> = HashMap::new();
            for i in 0..3u8 {
                manager.register_worker(worker(i), TransportHandle::new(i as u64));
                registered.insert(i);
            }

            for op in ops {
                match op {
                    Op::Bind { doc, task, worker: w } => {
                        let k = key(doc, task);
                        let result = manager.bind_assignment(k.clone(), &worker(w));
                        let holder = model.get(&k).copied();
                        match (registered.contains(&w), holder) {
                            (false, _) => prop_assert!(matches!(result, Err(StateError::UnknownWorker(_)))),
                            (true, Some(holder)) if holder != w => {
                                let is_conflict = matches!(result, Err(StateError::AlreadyAssigned { .. }));
                                prop_assert!(is_conflict);
                            }
                            (true, _) => {
                                prop_assert!(result.is_ok());
                                model.insert(k, w);
                            }
                        }
                    }
                    Op::Remove { doc, task } => {
                        let k = key(doc, task);
                        prop_assert_eq!(manager.remove_assignment(&k), model.remove(&k).is_some());
                    }
                    Op::Unregister { worker: w } => {
                        let removed = manager.unregister_worker(&worker(w).client_id);
                        let expected = model.values().filter(|h| **h == w).count();
                        prop_assert_eq!(removed.len(), expected);
                        model.retain(|_, h| *h != w);
                        registered.remove(&w);
                    }
                    Op::Register { worker: w } => {
                        manager.register_worker(worker(w), TransportHandle::new(w as u64));
                        registered.insert(w);
                    }
                }

                let live = manager.assignments();
                prop_assert_eq!(live.len(), model.len());
                for assignment in live {
                    let holder = model.get(&assignment.key).copied();
                    prop_assert_eq!(Some(assignment.client_id.clone()), holder.map(|h| worker(h).client_id));
                    prop_assert!(manager.get_worker(&assignment.client_id).is_some());
                }
            }
        }
    }
}
