//! In-memory broker transport for driving the session manager in tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use tally::{AgentConfig, Connector, Inbound, Session, TransportError};

/// Shared, inspectable state of the fake broker.
pub struct BrokerState {
    opens: AtomicUsize,
    fail_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    publish_ok: AtomicBool,
    /// Successful publishes.
    publishes: Mutex<Vec<(String, Vec<u8>)>>,
    /// Every publish attempt, including failed ones.
    attempts: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<String>>,
    current_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
}

impl BrokerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            fail_opens: AtomicUsize::new(0),
            open_delay: Mutex::new(Duration::ZERO),
            publish_ok: AtomicBool::new(true),
            publishes: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            current_tx: Mutex::new(None),
        })
    }

    /// Number of open attempts seen, successful or not.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` open attempts.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Make each open take this long (simulates a slow handshake).
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    /// Toggle whether publishes succeed.
    pub fn set_publish_ok(&self, ok: bool) {
        self.publish_ok.store(ok, Ordering::SeqCst);
    }

    /// Payloads successfully published to `topic`, in order.
    pub fn publishes_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.publishes
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn publish_count(&self, topic: &str) -> usize {
        self.publishes_to(topic).len()
    }

    /// All publish attempts on `topic`, including failed ones.
    pub fn attempts_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Deliver a message to the current session's stream.
    pub fn push_inbound(&self, topic: &str, payload: &[u8]) -> bool {
        let guard = self.current_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Inbound {
                    topic: topic.to_string(),
                    payload: Bytes::copy_from_slice(payload),
                })
                .is_ok(),
            None => false,
        }
    }

    /// End the current session's message stream, as a dying transport
    /// would.
    pub fn close_stream(&self) {
        self.current_tx.lock().unwrap().take();
    }
}

pub struct MockConnector(pub Arc<BrokerState>);

pub struct MockSession {
    state: Arc<BrokerState>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn open(&self, _config: &AgentConfig) -> Result<MockSession, TransportError> {
        let delay = *self.0.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.0.opens.fetch_add(1, Ordering::SeqCst);

        let remaining = self.0.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.0.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("mock broker refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.current_tx.lock().unwrap() = Some(tx);
        Ok(MockSession {
            state: self.0.clone(),
            inbound: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.state.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.state
            .attempts
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
        if !self.state.publish_ok.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("mock broker unavailable".to_string()));
        }
        self.state
            .publishes
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn messages(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound.lock().unwrap().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds or `timeout` of (possibly virtual) time
/// elapses.
pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return cond();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
