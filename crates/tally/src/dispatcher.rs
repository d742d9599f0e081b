//! Inbound dispatcher: applies key-status pushes from the broker.
//!
//! One dispatcher runs per session, consuming that session's message
//! stream. Malformed payloads are logged and skipped; the stream ending is
//! the transport's disconnect signal and triggers a gated reconnect.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tallyproto::{mask_api_key, topics, KeyStatus, KeyUpdateMessage};

use crate::session::SessionManager;
use crate::transport::{Connector, Inbound};

/// Invoked after each key-status update has been applied to the store.
/// Errors are logged and swallowed.
pub type KeyStatusCallback =
    Arc<dyn Fn(&str, KeyStatus, &str) -> anyhow::Result<()> + Send + Sync>;

pub(crate) fn spawn<C: Connector>(
    manager: Arc<SessionManager<C>>,
    mut stream: mpsc::UnboundedReceiver<Inbound>,
    epoch: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = manager.subscribe_shutdown();
        debug!("inbound dispatcher started (epoch {epoch})");
        loop {
            tokio::select! {
                inbound = stream.recv() => {
                    match inbound {
                        Some(inbound) => handle_inbound(&manager, inbound),
                        None => {
                            // Stream end: the transport died, or this
                            // session was replaced under us. Only the
                            // current session's dispatcher reacts.
                            if manager.is_terminated() || manager.epoch() != epoch {
                                debug!("inbound dispatcher exiting (epoch {epoch})");
                                break;
                            }
                            warn!("inbound stream ended, requesting reconnect");
                            manager.mark_suspect("inbound stream closed");
                            manager.request_reconnect().await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("inbound dispatcher shutting down (epoch {epoch})");
                    break;
                }
            }
        }
    })
}

fn handle_inbound<C: Connector>(manager: &SessionManager<C>, inbound: Inbound) {
    if inbound.topic != topics::KEYS_UPDATE {
        debug!("ignoring message on unexpected topic {}", inbound.topic);
        return;
    }
    let message = match KeyUpdateMessage::from_json(&inbound.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("malformed key update payload: {e}");
            return;
        }
    };
    info!(
        "key status update: {} entries (timestamp {})",
        message.updates.len(),
        message.timestamp
    );

    let callback = manager.key_status_callback();
    for update in &message.updates {
        // Store first, then callback: observers invoked for an update
        // always see it already applied.
        manager
            .keys()
            .apply_update(&update.key, update.status, update.reason_str());
        if let Some(callback) = &callback {
            if let Err(e) = callback(&update.key, update.status, update.reason_str()) {
                warn!(
                    "key status callback failed for {}: {e}",
                    mask_api_key(&update.key)
                );
            }
        }
    }
}
