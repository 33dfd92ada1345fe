//! In-process transport over tokio channels
//!
//! Each connected worker gets a mailbox of [`Envelope`]s. Connecting and dropping a
//! [`WorkerConnection`] feed the StateManager's register/unregister operations, the
//! way a socket layer would on connect and disconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use super::messages::{AckReply, NackInfo, WorkerMessage};
use super::{AckCallback, WorkerTransport};
use crate::domain::{Assignment, TransportHandle, WorkerDetail};
use crate::state::{StateManager, StateResponse};

const DEFAULT_MAILBOX: usize = 100;

/// A message delivered to a worker, with the means to acknowledge it
///
/// Dropping an envelope without replying means the sender never hears back.
pub struct Envelope {
    message: WorkerMessage,
    reply: AckCallback,
}

impl Envelope {
    pub fn message(&self) -> &WorkerMessage {
        &self.message
    }

    /// Acknowledge with a payload
    pub fn ack(self, payload: serde_json::Value) {
        (self.reply)(Ok(payload));
    }

    /// Decline the message
    pub fn nack(self, reason: impl Into<String>) {
        (self.reply)(Err(NackInfo::Declined { reason: reason.into() }));
    }

    fn reply(self, reply: AckReply) {
        (self.reply)(reply);
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope").field("message", &self.message).finish_non_exhaustive()
    }
}

struct ChannelInner {
    state: Arc<StateManager>,
    routes: Mutex<HashMap<TransportHandle, mpsc::Sender<Envelope>>>,
    next_handle: AtomicU64,
    mailbox: usize,
}

/// Worker transport backed by one mpsc mailbox per connection
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

impl ChannelTransport {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self::with_mailbox(state, DEFAULT_MAILBOX)
    }

    /// Create a transport whose worker mailboxes hold at most `mailbox` envelopes
    pub fn with_mailbox(state: Arc<StateManager>, mailbox: usize) -> Self {
        debug!(mailbox, "ChannelTransport::with_mailbox: called");
        Self {
            inner: Arc::new(ChannelInner {
                state,
                routes: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                mailbox: mailbox.max(1),
            }),
        }
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<TransportHandle, mpsc::Sender<Envelope>>> {
        self.inner.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a connection for a worker and register it with the StateManager
    pub fn connect(&self, detail: WorkerDetail) -> WorkerConnection {
        let handle = TransportHandle::new(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(client_id = %detail.client_id, %handle, "ChannelTransport::connect: called");
        let (tx, rx) = mpsc::channel(self.inner.mailbox);
        self.routes().insert(handle, tx);
        self.inner.state.register_worker(detail.clone(), handle);
        info!(client_id = %detail.client_id, kind = %detail.kind, %handle, "Worker connected");

        WorkerConnection {
            detail,
            handle,
            rx,
            transport: self.clone(),
            open: true,
        }
    }

    /// Number of open connections
    pub fn connected(&self) -> usize {
        self.routes().len()
    }

    fn disconnect(&self, detail: &WorkerDetail, handle: TransportHandle) -> Vec<Assignment> {
        debug!(client_id = %detail.client_id, %handle, "ChannelTransport::disconnect: called");
        self.routes().remove(&handle);

        // A reconnect under the same client id replaces the registry entry; only the
        // connection that still owns it may unregister the worker.
        match self.inner.state.unregister_worker_if(&detail.client_id, handle) {
            Some(removed) => {
                info!(client_id = %detail.client_id, reaped = removed.len(), "Worker disconnected");
                removed
            }
            None => {
                debug!(client_id = %detail.client_id, "ChannelTransport::disconnect: superseded connection");
                Vec::new()
            }
        }
    }
}

impl WorkerTransport for ChannelTransport {
    fn send(&self, handle: &TransportHandle, message: WorkerMessage, on_ack: AckCallback) {
        debug!(%handle, name = message.name(), "ChannelTransport::send: called");
        let route = self.routes().get(handle).cloned();
        let Some(tx) = route else {
            debug!(%handle, "ChannelTransport::send: no route");
            on_ack(Err(NackInfo::Undeliverable {
                reason: format!("no connection for {}", handle),
            }));
            return;
        };

        let envelope = Envelope { message, reply: on_ack };
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => envelope.reply(Err(NackInfo::Undeliverable {
                reason: format!("mailbox full for {}", handle),
            })),
            Err(TrySendError::Closed(envelope)) => envelope.reply(Err(NackInfo::Undeliverable {
                reason: format!("connection {} closed", handle),
            })),
        }
    }
}

/// Worker side of a channel connection
///
/// Dropping the connection disconnects the worker.
pub struct WorkerConnection {
    detail: WorkerDetail,
    handle: TransportHandle,
    rx: mpsc::Receiver<Envelope>,
    transport: ChannelTransport,
    open: bool,
}

impl WorkerConnection {
    pub fn detail(&self) -> &WorkerDetail {
        &self.detail
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Take a message if one is waiting
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Send a worker-level liveness signal
    pub fn heartbeat(&self) -> StateResponse<()> {
        self.transport.inner.state.heartbeat_worker(&self.detail.client_id)
    }

    /// Disconnect, returning the assignments reaped with this worker
    pub fn disconnect(mut self) -> Vec<Assignment> {
        self.open = false;
        self.transport.disconnect(&self.detail, self.handle)
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        if self.open {
            self.transport.disconnect(&self.detail, self.handle);
        }
    }
}
