//! Queue one usage report against a local broker and wait for delivery.
//!
//! Run a plaintext broker (e.g. `mosquitto -p 1883`) and then:
//! `cargo run --example report_demo -- localhost`

use std::time::Duration;

use tally::{AgentConfig, BillingAgent, TlsMode};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug".into()),
        )
        .init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost".to_string());

    let agent = BillingAgent::init(
        AgentConfig::new(&host)
            .with_port(1883)
            .with_tls(TlsMode::Plaintext),
    );
    agent.start();

    agent.report("demo-key", "llm", "gpt-4", 42, None);

    if agent.wait_queue_empty(Duration::from_secs(10)).await {
        println!("usage report delivered");
    } else {
        let status = agent.queue_status();
        println!(
            "delivery timed out; {} records still queued (connected: {})",
            status.queued, status.connected
        );
    }
    agent.disconnect().await;
}
