//! Worker transport contract
//!
//! The scheduler only consumes this contract: send a named message to one worker
//! and get an acknowledgment callback that fires at most once. Timeouts are applied
//! by the caller through [`request`], never assumed from the transport.

mod channel;
mod messages;

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

pub use channel::{ChannelTransport, Envelope, WorkerConnection};
pub use messages::{AckError, AckReply, NackInfo, WorkerMessage};

use crate::domain::TransportHandle;

/// Acknowledgment callback; consumed by the first (and only) reply
pub type AckCallback = Box<dyn FnOnce(AckReply) + Send + 'static>;

/// Bidirectional message channel to worker processes
pub trait WorkerTransport: Send + Sync {
    /// Attempt delivery of `message` to the worker behind `handle`
    ///
    /// `on_ack` is invoked once with the worker's reply or a delivery failure,
    /// or dropped without being invoked if the reply is lost.
    fn send(&self, handle: &TransportHandle, message: WorkerMessage, on_ack: AckCallback);
}

/// Send `message` and wait up to `timeout` for its acknowledgment
pub async fn request(
    transport: &dyn WorkerTransport,
    handle: &TransportHandle,
    message: WorkerMessage,
    timeout: Duration,
) -> Result<serde_json::Value, AckError> {
    debug!(%handle, name = message.name(), ?timeout, "request: called");
    let (reply_tx, reply_rx) = oneshot::channel();
    transport.send(
        handle,
        message,
        Box::new(move |reply| {
            let _ = reply_tx.send(reply);
        }),
    );

    match tokio::time::timeout(timeout, reply_rx).await {
        Err(_) => {
            debug!(%handle, "request: timed out");
            Err(AckError::AckTimeout { timeout })
        }
        Ok(Err(_)) => {
            debug!(%handle, "request: callback dropped without reply");
            Err(AckError::Delivery("acknowledgment channel dropped".to_string()))
        }
        Ok(Ok(Ok(payload))) => Ok(payload),
        Ok(Ok(Err(nack))) => Err(nack.into()),
    }
}
