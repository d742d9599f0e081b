//! tally - client-side billing and access-control agent
//!
//! Embeds into processes that front third-party AI APIs and talks to a
//! central billing broker over a single long-lived MQTT-over-TLS session.
//! Two duties run concurrently:
//!
//! - **Usage reporting**: [`BillingAgent::report`] queues usage records,
//!   which a background drainer delivers at least once, surviving broker
//!   disconnects.
//! - **Credential lifecycle**: the broker pushes key-status changes; the
//!   agent keeps a live valid/blocked partition that
//!   [`BillingAgent::is_key_valid`] reads without blocking. Keys never
//!   seen in an update are not valid.
//!
//! The session manager in between owns the link: a rate-limited,
//! budgeted reconnect gate, a heartbeat-driven liveness check, and a
//! per-session inbound dispatcher.
//!
//! ```no_run
//! use tally::{AgentConfig, BillingAgent};
//!
//! # async fn demo() {
//! let agent = BillingAgent::init(
//!     AgentConfig::new("broker.internal").with_credentials("svc", "secret"),
//! );
//! agent.start();
//!
//! agent.report("api-key-123", "llm", "gpt-4", 100, None);
//! if !agent.is_key_valid("api-key-123") {
//!     // reject the request
//! }
//! # }
//! ```
//!
//! By default the TLS layer accepts any broker certificate (the historical
//! wire behavior for private networks); pass
//! [`TlsMode::Custom`](config::TlsMode) to verify.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod drainer;
pub mod error;
pub mod facade;
pub mod heartbeat;
pub mod keystore;
pub mod queue;
pub mod session;
pub mod transport;

pub use config::{AgentConfig, TlsMode, DEFAULT_BROKER_PORT};
pub use dispatcher::KeyStatusCallback;
pub use error::AgentError;
pub use facade::{report_usage, BillingAgent, QueueStatus};
pub use keystore::KeyStore;
pub use queue::UsageQueue;
pub use session::{SessionManager, SessionState};
pub use transport::{Connector, Inbound, MqttConnector, Session, TransportError};

pub use tallyproto::{mask_api_key, KeyStatus, UsageRecord};
