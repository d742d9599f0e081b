//! Process-wide facade: one billing agent per process.
//!
//! Request handlers call [`BillingAgent::report`] and
//! [`BillingAgent::is_key_valid`]; neither touches the network. The first
//! `init` wins: later calls get the existing instance and their
//! configuration is ignored.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info};

use tallyproto::{mask_api_key, UsageRecord};

use crate::config::AgentConfig;
use crate::dispatcher::KeyStatusCallback;
use crate::error::AgentError;
use crate::session::{SessionManager, SessionState};
use crate::transport::{MqttConnector, TransportError};

static INSTANCE: OnceLock<Arc<BillingAgent>> = OnceLock::new();

/// Snapshot of queue and link state for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Usage records waiting for delivery.
    pub queued: usize,
    /// Records delivered since startup.
    pub delivered: u64,
    /// Publish attempts that failed and were requeued.
    pub failed_publishes: u64,
    pub connected: bool,
    pub state: SessionState,
}

pub struct BillingAgent {
    manager: Arc<SessionManager<MqttConnector>>,
}

impl BillingAgent {
    /// Initialize the process-wide agent. First construction wins: when an
    /// instance already exists it is returned unchanged and `config` is
    /// dropped.
    ///
    /// This does not touch the network; call [`BillingAgent::start`] to
    /// launch the background workers, or [`BillingAgent::connect`] to
    /// connect explicitly.
    pub fn init(config: AgentConfig) -> Arc<BillingAgent> {
        INSTANCE
            .get_or_init(|| {
                info!(
                    "billing agent initialized for {}:{}",
                    config.broker_host, config.broker_port
                );
                Arc::new(BillingAgent {
                    manager: SessionManager::new(MqttConnector, config),
                })
            })
            .clone()
    }

    /// The shared instance, or [`AgentError::Uninitialized`].
    pub fn instance() -> Result<Arc<BillingAgent>, AgentError> {
        INSTANCE.get().cloned().ok_or(AgentError::Uninitialized)
    }

    /// The shared instance if one exists.
    pub fn try_instance() -> Option<Arc<BillingAgent>> {
        INSTANCE.get().cloned()
    }

    pub fn is_initialized() -> bool {
        INSTANCE.get().is_some()
    }

    /// Launch the drainer, heartbeat and initial-connect workers. Must run
    /// inside a tokio runtime. Background connect failures feed the
    /// backoff machine instead of surfacing.
    pub fn start(&self) {
        self.manager.start();
    }

    /// Explicit connect; surfaces transport errors, unlike the background
    /// reconnect path.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.manager.connect().await
    }

    pub fn config(&self) -> &AgentConfig {
        self.manager.config()
    }

    /// Queue a usage record for delivery and return it. Never blocks on
    /// the network: the queued copy is held until the drainer can deliver
    /// it, across disconnects if necessary.
    pub fn report(
        &self,
        api_key: &str,
        module: &str,
        model: &str,
        usage: u64,
        metadata: Option<Map<String, Value>>,
    ) -> UsageRecord {
        let mut record = UsageRecord::new(api_key, module, model, usage);
        record.metadata = metadata;
        debug!(
            "usage queued: {} {}/{} usage={}",
            mask_api_key(api_key),
            module,
            model,
            usage
        );
        self.manager.queue().enqueue(record.clone());
        record
    }

    /// Whether `api_key` is currently permitted. Unknown keys are not.
    pub fn is_key_valid(&self, api_key: &str) -> bool {
        self.manager.keys().is_valid(api_key)
    }

    pub fn valid_keys(&self) -> HashSet<String> {
        self.manager.keys().valid_keys()
    }

    pub fn blocked_keys(&self) -> HashSet<String> {
        self.manager.keys().blocked_keys()
    }

    pub fn blocked_reason(&self, api_key: &str) -> Option<String> {
        self.manager.keys().blocked_reason(api_key)
    }

    /// Register a callback invoked after each key-status change is
    /// applied. Callback errors are logged and swallowed.
    pub fn set_key_status_callback(&self, callback: KeyStatusCallback) {
        self.manager.set_key_status_callback(callback);
    }

    /// Ask the broker to push the full key list again.
    pub async fn request_keys_list(&self) -> Result<(), TransportError> {
        self.manager.request_keys_list().await
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.manager.queue().len(),
            delivered: self.manager.queue().delivered(),
            failed_publishes: self.manager.queue().failed_publishes(),
            connected: self.manager.is_connected(),
            state: self.manager.state(),
        }
    }

    /// Drop all queued records. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        self.manager.queue().drain()
    }

    /// Wait until every queued and in-flight record has been delivered,
    /// or `timeout` elapses. Returns false on timeout; delivery keeps
    /// going either way.
    pub async fn wait_queue_empty(&self, timeout: Duration) -> bool {
        self.manager.queue().wait_empty(timeout).await
    }

    /// Stop all background work and close the connection. Queued records
    /// are lost.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }
}

/// Queue a usage report through the process-wide agent.
///
/// Errors only when [`BillingAgent::init`] has not been called; transport
/// trouble never surfaces here, the queue absorbs it.
pub fn report_usage(
    api_key: &str,
    module: &str,
    model: &str,
    usage: u64,
    metadata: Option<Map<String, Value>>,
) -> Result<(), AgentError> {
    let agent = BillingAgent::instance()?;
    agent.report(api_key, module, model, usage, metadata);
    Ok(())
}
