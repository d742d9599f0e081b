//! Session manager: owns the MQTT link and the reconnect state machine.
//!
//! One async mutex serializes connect, reconnect, cleanup and disconnect.
//! The backoff gate sits in its own short-held sync mutex so a concurrent
//! reconnect trigger observes the in-progress flag and returns immediately
//! instead of queueing behind a slow open. Publishers read the current
//! session through a separate RwLock, so a reconnect in flight never
//! blocks `report` callers.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tallyproto::{topics, ControlMessage, KeysRequestMessage};

use crate::backoff::BackoffGate;
use crate::config::AgentConfig;
use crate::dispatcher::{self, KeyStatusCallback};
use crate::drainer;
use crate::heartbeat;
use crate::keystore::KeyStore;
use crate::queue::UsageQueue;
use crate::transport::{Connector, Session, TransportError};

/// Link state as seen by workers and the facade.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    /// A disconnect was detected; the next gated trigger reopens.
    Reconnecting = 3,
    /// Disconnect was called; the manager never connects again.
    Terminated = 4,
}

impl SessionState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Reconnecting,
            4 => SessionState::Terminated,
            _ => SessionState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SessionManager<C: Connector> {
    connector: C,
    config: AgentConfig,
    /// Current transport session; publishers take read snapshots.
    session: RwLock<Option<Arc<C::Session>>>,
    /// Bumped each time a new session is installed. A dispatcher whose
    /// stream ends compares its epoch against this before reacting, so a
    /// superseded session cannot tear down its replacement.
    epoch: AtomicU64,
    /// Serializes connect/reconnect/cleanup/disconnect.
    conn_lock: Mutex<()>,
    /// Reconnect gate; held only for the flag check, never across awaits.
    gate: StdMutex<BackoffGate>,
    state: AtomicU8,
    last_heartbeat_success: StdRwLock<Instant>,
    keys: Arc<KeyStore>,
    queue: Arc<UsageQueue>,
    callback: StdRwLock<Option<KeyStatusCallback>>,
    shutdown: broadcast::Sender<()>,
    /// Worker task handles, awaited (then aborted) on disconnect.
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

/// How long disconnect waits for a worker to observe the shutdown signal
/// before aborting it.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C, config: AgentConfig) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(4);
        let gate = BackoffGate::new(
            config.reconnect_delay,
            config.max_reconnect_attempts,
            config.cooldown_multiplier,
        );
        Arc::new(Self {
            connector,
            session: RwLock::new(None),
            epoch: AtomicU64::new(0),
            conn_lock: Mutex::new(()),
            gate: StdMutex::new(gate),
            state: AtomicU8::new(SessionState::Idle as u8),
            last_heartbeat_success: StdRwLock::new(Instant::now()),
            keys: Arc::new(KeyStore::new()),
            queue: Arc::new(UsageQueue::new()),
            callback: StdRwLock::new(None),
            shutdown,
            workers: StdMutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn queue(&self) -> &Arc<UsageQueue> {
        &self.queue
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Register the callback invoked after each applied key update.
    pub fn set_key_status_callback(&self, callback: KeyStatusCallback) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn key_status_callback(&self) -> Option<KeyStatusCallback> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Spawn the long-lived workers and kick off the initial connect in
    /// the background. A failed background connect is swallowed; the
    /// heartbeat worker keeps retrying through the backoff gate.
    pub fn start(self: &Arc<Self>) {
        self.track_worker(drainer::spawn(self.clone()));
        self.track_worker(heartbeat::spawn(self.clone()));
        let manager = self.clone();
        let connect_task = tokio::spawn(async move {
            if let Err(e) = manager.connect().await {
                debug!("initial connect failed: {e} (background retry will follow)");
            }
        });
        self.track_worker(connect_task);
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Explicit connect. Surfaces transport errors to the caller;
    /// background reconnects go through
    /// [`SessionManager::request_reconnect`] instead and never surface.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.is_terminated() {
            return Err(TransportError::SessionClosed);
        }
        let _guard = self.conn_lock.lock().await;
        let result = self.establish().await;
        if result.is_ok() {
            self.gate
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset_attempts();
        }
        result
    }

    /// Backoff-gated reconnect. Returns true when this caller ran an
    /// attempt and it succeeded; false when the gate denied the trigger or
    /// the attempt failed. Concurrent triggers observe the in-progress
    /// flag and return immediately without touching the gate.
    pub async fn request_reconnect(self: &Arc<Self>) -> bool {
        if self.is_terminated() {
            return false;
        }
        let granted = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(Instant::now());
        if !granted {
            debug!("reconnect trigger denied by backoff gate");
            return false;
        }

        let result = {
            let _guard = self.conn_lock.lock().await;
            self.establish().await
        };
        let success = result.is_ok();
        if let Err(e) = result {
            warn!("reconnect attempt failed: {e}");
        }
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(success);
        success
    }

    /// The connect procedure proper. Caller must hold the conn lock.
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.is_terminated() {
            return Err(TransportError::SessionClosed);
        }

        // A live session that still answers a ping probe is kept as is.
        if self.is_connected() {
            if self.probe().await {
                // The probe proved liveness, which is as good as a
                // heartbeat.
                self.record_heartbeat_success();
                debug!("already connected and probe succeeded, skipping");
                return Ok(());
            }
            info!("connection probe failed, reopening session");
        }
        self.cleanup().await;

        self.set_state(SessionState::Connecting);
        info!(
            "connecting to MQTT broker {}:{}",
            self.config.broker_host, self.config.broker_port
        );
        let session = match self.connector.open(&self.config).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!("failed to open MQTT session: {e}");
                self.set_state(SessionState::Idle);
                return Err(e);
            }
        };

        if let Err(e) = session.subscribe(topics::KEYS_UPDATE).await {
            warn!("subscribe to {} failed: {e}", topics::KEYS_UPDATE);
            session.close().await;
            self.set_state(SessionState::Idle);
            return Err(e);
        }

        *self.session.write().await = Some(session.clone());
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(stream) = session.messages() {
            self.track_worker(dispatcher::spawn(self.clone(), stream, epoch));
        } else {
            warn!("session message stream was already taken");
        }

        self.record_heartbeat_success();
        self.set_state(SessionState::Connected);
        info!("MQTT session established");

        // Ask the broker for the current key list. Failure is not fatal:
        // the broker pushes changes as they happen anyway.
        match KeysRequestMessage::now().to_json() {
            Ok(body) => {
                if let Err(e) = session.publish(topics::KEYS_REQUEST, body).await {
                    warn!("key list request failed: {e}");
                } else {
                    debug!("key list requested");
                }
            }
            Err(e) => warn!("could not encode key list request: {e}"),
        }

        Ok(())
    }

    /// Liveness probe for an apparently-connected session.
    async fn probe(&self) -> bool {
        let body = match ControlMessage::ping().to_json() {
            Ok(body) => body,
            Err(_) => return false,
        };
        match self.publish(topics::PING, body).await {
            Ok(()) => true,
            Err(e) => {
                debug!("ping probe failed: {e}");
                false
            }
        }
    }

    /// Drop the current session, closing the transport. Caller must hold
    /// the conn lock. Closing ends the session's message stream, which
    /// stops its dispatcher.
    async fn cleanup(&self) {
        if let Some(session) = self.session.write().await.take() {
            session.close().await;
            debug!("previous session closed");
        }
    }

    /// Publish through the current session.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let session = self.session.read().await.clone();
        match session {
            Some(session) => session.publish(topic, payload).await,
            None => Err(TransportError::SessionClosed),
        }
    }

    /// Manually request a fresh key list from the broker.
    pub async fn request_keys_list(&self) -> Result<(), TransportError> {
        let body = KeysRequestMessage::now()
            .to_json()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        self.publish(topics::KEYS_REQUEST, body).await
    }

    /// A worker saw a publish fail: drop out of Connected so the heartbeat
    /// path drives a gated reconnect.
    pub fn mark_suspect(&self, reason: &str) {
        if self.state() == SessionState::Connected {
            warn!("session suspected bad: {reason}");
            self.set_state(SessionState::Reconnecting);
        }
    }

    pub(crate) fn record_heartbeat_success(&self) {
        *self
            .last_heartbeat_success
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Whether the last successful heartbeat is within `timeout`.
    pub(crate) fn heartbeat_fresh(&self, timeout: Duration) -> bool {
        let last = *self
            .last_heartbeat_success
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Instant::now().duration_since(last) <= timeout
    }

    /// Tear down: signal workers, close the transport, then wait for the
    /// workers to observe the signal. Idempotent. Records still queued are
    /// lost.
    pub async fn disconnect(&self) {
        let previous = self
            .state
            .swap(SessionState::Terminated as u8, Ordering::SeqCst);
        if previous == SessionState::Terminated as u8 {
            return;
        }
        let _ = self.shutdown.send(());
        {
            // Closing the transport also wakes workers suspended on a
            // network read.
            let _guard = self.conn_lock.lock().await;
            if let Some(session) = self.session.write().await.take() {
                session.close().await;
            }
        }
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut worker in workers {
            if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, &mut worker)
                .await
                .is_err()
            {
                warn!("worker did not stop within grace period, aborting");
                worker.abort();
            }
        }
        info!("billing session terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Reconnecting,
            SessionState::Terminated,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
        assert_eq!(SessionState::from_u8(200), SessionState::Idle);
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(SessionState::Connected.as_str(), "connected");
        assert_eq!(SessionState::Terminated.to_string(), "terminated");
    }
}
