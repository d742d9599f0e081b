//! Construction-time configuration for the agent.
//!
//! There is no file or environment loading here: the embedding process
//! passes everything when it initializes the facade.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

/// Default MQTT-over-TLS broker port.
pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// TLS behavior of the transport.
#[derive(Clone)]
pub enum TlsMode {
    /// TLS 1.2+, hostname verification off, peer certificate validation
    /// off. Insecure; only acceptable on private networks where the broker
    /// runs a self-signed certificate. This is the default for wire
    /// compatibility with existing deployments.
    InsecureNoVerify,
    /// Caller-supplied rustls configuration for deployments that verify
    /// the broker certificate.
    Custom(Arc<rustls::ClientConfig>),
    /// Plain TCP. Intended for local brokers and tests.
    Plaintext,
}

impl fmt::Debug for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::InsecureNoVerify => f.write_str("InsecureNoVerify"),
            TlsMode::Custom(_) => f.write_str("Custom(..)"),
            TlsMode::Plaintext => f.write_str("Plaintext"),
        }
    }
}

/// Configuration for the billing agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Target broker hostname.
    pub broker_host: String,
    /// Broker port, 8883 unless overridden.
    pub broker_port: u16,
    /// Optional MQTT AUTH credentials.
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT client id; generated per process unless overridden.
    pub client_id: String,
    pub tls: TlsMode,
    /// Base delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Reconnect attempts permitted before the cooldown applies.
    pub max_reconnect_attempts: u32,
    /// Cooldown is `reconnect_delay * cooldown_multiplier`.
    pub cooldown_multiplier: u32,
    /// How often the heartbeat worker ticks.
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this mark the session stale.
    pub connection_timeout: Duration,
    /// Bound on a single transport open (TCP + TLS + CONNACK).
    pub connect_timeout: Duration,
    /// MQTT keep-alive advertised to the broker.
    pub keep_alive: Duration,
    /// Drainer dequeue poll, short enough to notice shutdown.
    pub drain_poll_timeout: Duration,
    /// Drainer pause after a failed or impossible delivery.
    pub retry_pause: Duration,
}

impl AgentConfig {
    pub fn new(broker_host: &str) -> Self {
        Self {
            broker_host: broker_host.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            username: None,
            password: None,
            client_id: format!("tally-{}", Uuid::new_v4().simple()),
            tls: TlsMode::InsecureNoVerify,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            cooldown_multiplier: 2,
            heartbeat_interval: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            drain_poll_timeout: Duration::from_secs(1),
            retry_pause: Duration::from_millis(500),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_cooldown_multiplier(mut self, multiplier: u32) -> Self {
        self.cooldown_multiplier = multiplier;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_drain_poll_timeout(mut self, timeout: Duration) -> Self {
        self.drain_poll_timeout = timeout;
        self
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// The post-budget cooldown window.
    pub fn cooldown(&self) -> Duration {
        self.reconnect_delay * self.cooldown_multiplier
    }
}
