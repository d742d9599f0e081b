//! Heartbeat worker: proves liveness and drives reconnects.
//!
//! Every tick the worker either publishes a heartbeat (healthy session,
//! recent success) or asks the session manager for a gated reconnect
//! (disconnected, or the last successful heartbeat is too old). A failed
//! heartbeat publish only marks the session suspect; the reconnect then
//! happens on the next tick through the normal path.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use tallyproto::{topics, ControlMessage};

use crate::session::SessionManager;
use crate::transport::Connector;

pub(crate) fn spawn<C: Connector>(manager: Arc<SessionManager<C>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = manager.subscribe_shutdown();
        let mut ticker = tokio::time::interval(manager.config().heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // An interval yields immediately; swallow that first tick so the
        // first heartbeat lands one full period after connect.
        ticker.tick().await;
        debug!(
            "heartbeat task started (interval {:?})",
            manager.config().heartbeat_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&manager).await,
                _ = shutdown.recv() => {
                    debug!("heartbeat task shutting down");
                    break;
                }
            }
        }
    })
}

/// One heartbeat evaluation.
pub(crate) async fn tick<C: Connector>(manager: &Arc<SessionManager<C>>) {
    if manager.is_terminated() {
        return;
    }
    let timeout = manager.config().connection_timeout;
    if manager.is_connected() && manager.heartbeat_fresh(timeout) {
        let body = match ControlMessage::heartbeat().to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!("could not encode heartbeat: {e}");
                return;
            }
        };
        match manager.publish(topics::HEARTBEAT, body).await {
            Ok(()) => {
                manager.record_heartbeat_success();
                trace!("heartbeat ok");
            }
            Err(e) => {
                warn!("heartbeat publish failed: {e}");
                manager.mark_suspect("heartbeat publish failed");
            }
        }
    } else {
        debug!(
            "session not healthy (state {}), requesting reconnect",
            manager.state()
        );
        manager.request_reconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::transport::{Connector, Inbound, Session, TransportError};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Shared {
        opens: AtomicUsize,
        publishes: Mutex<Vec<String>>,
    }

    struct LoopbackConnector(Arc<Shared>);
    struct LoopbackSession {
        shared: Arc<Shared>,
        inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
        /// Keeps the message stream open for the session's lifetime.
        _inbound_tx: mpsc::UnboundedSender<Inbound>,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        type Session = LoopbackSession;

        async fn open(&self, _config: &AgentConfig) -> Result<LoopbackSession, TransportError> {
            self.0.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(LoopbackSession {
                shared: self.0.clone(),
                inbound: Mutex::new(Some(rx)),
                _inbound_tx: tx,
            })
        }
    }

    #[async_trait]
    impl Session for LoopbackSession {
        async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
            self.shared.publishes.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn messages(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
            self.inbound.lock().unwrap().take()
        }

        async fn close(&self) {}
    }

    fn count(shared: &Shared, topic: &str) -> usize {
        shared
            .publishes
            .lock()
            .unwrap()
            .iter()
            .filter(|t| *t == topic)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_tick_publishes_heartbeat() {
        let shared = Arc::new(Shared::default());
        let manager = SessionManager::new(
            LoopbackConnector(shared.clone()),
            AgentConfig::new("broker"),
        );
        manager.connect().await.unwrap();

        tick(&manager).await;
        assert_eq!(count(&shared, topics::HEARTBEAT), 1);
        assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_tick_skips_publish_and_requests_reconnect() {
        let shared = Arc::new(Shared::default());
        let manager = SessionManager::new(
            LoopbackConnector(shared.clone()),
            AgentConfig::new("broker"),
        );
        manager.connect().await.unwrap();

        // 31 s without a successful heartbeat: past the 30 s timeout.
        tokio::time::advance(Duration::from_secs(31)).await;
        tick(&manager).await;

        assert_eq!(count(&shared, topics::HEARTBEAT), 0);
        // The reconnect request ran; the still-healthy session answered
        // the ping probe, so no reopen was needed.
        assert_eq!(count(&shared, topics::PING), 1);
        assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_tick_reconnects() {
        let shared = Arc::new(Shared::default());
        let manager = SessionManager::new(
            LoopbackConnector(shared.clone()),
            AgentConfig::new("broker"),
        );

        tick(&manager).await;
        assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }
}
