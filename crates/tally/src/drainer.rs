//! Queue drainer: delivers queued usage records, at least once.
//!
//! Records pulled while disconnected, or whose publish fails, go back to
//! the queue; a failed publish also marks the session suspect so the
//! heartbeat worker drives a reconnect. Duplicate suppression is the
//! broker's responsibility.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use tallyproto::{mask_api_key, now_millis, topics, UsageMessage, UsageRecord};

use crate::session::SessionManager;
use crate::transport::Connector;

pub(crate) fn spawn<C: Connector>(manager: Arc<SessionManager<C>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = manager.subscribe_shutdown();
        let poll = manager.config().drain_poll_timeout;
        let pause = manager.config().retry_pause;
        debug!("queue drainer started");
        loop {
            tokio::select! {
                record = manager.queue().dequeue_timeout(poll) => {
                    if let Some(record) = record {
                        drain_one(&manager, record, pause).await;
                    }
                }
                _ = shutdown.recv() => {
                    debug!(
                        "queue drainer shutting down ({} records pending)",
                        manager.queue().len()
                    );
                    break;
                }
            }
        }
    })
}

async fn drain_one<C: Connector>(
    manager: &Arc<SessionManager<C>>,
    record: UsageRecord,
    pause: Duration,
) {
    if !manager.is_connected() {
        manager.queue().requeue(record);
        tokio::time::sleep(pause).await;
        return;
    }

    // Stamped at publish time; a retried record gets a fresh timestamp.
    let message = UsageMessage::from_record(&record, now_millis());
    let body = match message.to_json() {
        Ok(body) => body,
        Err(e) => {
            error!("dropping unserializable usage record: {e}");
            manager.queue().discard();
            return;
        }
    };

    match manager.publish(topics::REPORT, body).await {
        Ok(()) => {
            manager.queue().ack();
            debug!(
                "usage report delivered: {} {}/{} usage={}",
                mask_api_key(&record.api_key),
                record.module,
                record.model,
                record.usage
            );
        }
        Err(e) => {
            warn!("usage report publish failed, requeueing: {e}");
            manager.queue().record_publish_failure();
            manager.queue().requeue(record);
            manager.mark_suspect("usage publish failed");
            tokio::time::sleep(pause).await;
        }
    }
}
