//! MQTT-over-TLS transport adapter.
//!
//! The session manager stays generic over [`Connector`] so tests can drive
//! it with an in-memory transport; [`MqttConnector`] is the production
//! implementation on rumqttc. One open call produces one session: a poll
//! error ends the session rather than leaning on rumqttc's own reconnect,
//! because reconnect policy lives in the session manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::{AgentConfig, TlsMode};

/// Capacity of the rumqttc request channel between client and event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open MQTT connection: {0}")]
    Connect(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("session is closed")]
    SessionClosed,
}

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Bytes,
}

/// One live broker link.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Fire-and-forget publish. Must fail loudly once the link is dead so
    /// the drainer can requeue instead of silently dropping records.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Take the inbound message stream. Yields until close or transport
    /// error; the consumer treats termination as the disconnect signal.
    /// Returns `None` after the first call.
    fn messages(&self) -> Option<mpsc::UnboundedReceiver<Inbound>>;

    /// Idempotent teardown; never errors upward.
    async fn close(&self);
}

/// Opens sessions. The seam the session manager is generic over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn open(&self, config: &AgentConfig) -> Result<Self::Session, TransportError>;
}

/// Certificate verifier that accepts any broker certificate.
///
/// The insecure default: billing brokers on private networks run
/// self-signed certificates, and the historical wire behavior is to skip
/// verification. Production profiles should pass `TlsMode::Custom`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    )
}

/// Production connector: rumqttc AsyncClient over TLS.
pub struct MqttConnector;

/// A live rumqttc session.
///
/// The event loop runs on a background task that forwards inbound
/// publishes into the message channel. When the loop errors the task
/// flips `alive` and drops the sender, which both makes `publish` fail
/// loudly and ends the message stream.
pub struct MqttSession {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn open(&self, config: &AgentConfig) -> Result<MqttSession, TransportError> {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(config.keep_alive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        match &config.tls {
            TlsMode::InsecureNoVerify => {
                options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                    insecure_tls_config(),
                )));
            }
            TlsMode::Custom(tls) => {
                options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                    tls.clone(),
                )));
            }
            TlsMode::Plaintext => {}
        }

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        // Drive the event loop by hand until the broker acknowledges the
        // connection, so open failures surface here instead of later.
        let connack = tokio::time::timeout(config.connect_timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            return Ok(());
                        }
                        return Err(TransportError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    Ok(event) => trace!("MQTT event before CONNACK: {event:?}"),
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                }
            }
        })
        .await;
        match connack {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::Timeout(config.connect_timeout)),
        }
        debug!(
            "MQTT connection established to {}:{}",
            config.broker_host, config.broker_port
        );

        let alive = Arc::new(AtomicBool::new(true));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let task_alive = alive.clone();
        let poll_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let inbound = Inbound {
                            topic: publish.topic.clone(),
                            payload: publish.payload,
                        };
                        if inbound_tx.send(inbound).is_err() {
                            debug!("inbound receiver dropped, stopping MQTT poll task");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("broker sent DISCONNECT");
                        break;
                    }
                    Ok(event) => trace!("MQTT event: {event:?}"),
                    Err(e) => {
                        if task_alive.load(Ordering::SeqCst) {
                            warn!("MQTT event loop error: {e}");
                        }
                        break;
                    }
                }
            }
            // Dropping inbound_tx closes the message stream, which the
            // dispatcher treats as the disconnect signal.
            task_alive.store(false, Ordering::SeqCst);
        });

        Ok(MqttSession {
            client,
            alive,
            inbound: Mutex::new(Some(inbound_rx)),
            poll_task: Mutex::new(Some(poll_task)),
        })
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn messages(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound.lock().ok()?.take()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect error (ignored): {e}");
        }
        let handle = self.poll_task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
