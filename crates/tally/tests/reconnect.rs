//! Reconnect interlock, rate limiting and the attempt budget.

mod support;

use std::time::Duration;

use pretty_assertions::assert_eq;
use support::{wait_until, BrokerState, MockConnector};
use tally::{AgentConfig, SessionManager};

fn manager_with(
    state: &std::sync::Arc<BrokerState>,
) -> std::sync::Arc<SessionManager<MockConnector>> {
    SessionManager::new(MockConnector(state.clone()), AgentConfig::new("broker"))
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_run_exactly_one_reconnect() {
    let state = BrokerState::new();
    state.set_open_delay(Duration::from_millis(200));
    let manager = manager_with(&state);

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request_reconnect().await })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(state.opens(), 1);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn second_trigger_within_base_delay_is_rejected() {
    let state = BrokerState::new();
    let manager = manager_with(&state);

    assert!(manager.request_reconnect().await);
    assert_eq!(state.opens(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!manager.request_reconnect().await);
    assert_eq!(state.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn spent_budget_rejects_until_cooldown_then_resets() {
    let state = BrokerState::new();
    state.fail_next_opens(5);
    let manager = manager_with(&state);

    // Three consecutive failed opens, each past the base delay.
    for expected in 1..=3 {
        manager.request_reconnect().await;
        assert_eq!(state.opens(), expected);
        tokio::time::advance(Duration::from_secs(6)).await;
    }

    // Budget spent: past the base delay but inside the cooldown, the
    // trigger is rejected without an open.
    manager.request_reconnect().await;
    assert_eq!(state.opens(), 3);

    // Past last_attempt + 2D the trigger is accepted again.
    tokio::time::advance(Duration::from_secs(5)).await;
    manager.request_reconnect().await;
    assert_eq!(state.opens(), 4);

    // The counter was reset by the cooldown grant: a spaced follow-up
    // trigger still gets through instead of hitting the budget.
    tokio::time::advance(Duration::from_secs(6)).await;
    manager.request_reconnect().await;
    assert_eq!(state.opens(), 5);
}

#[tokio::test(start_paused = true)]
async fn dead_inbound_stream_triggers_reconnect() {
    let state = BrokerState::new();
    let manager = manager_with(&state);
    manager.connect().await.unwrap();
    assert_eq!(state.opens(), 1);

    state.close_stream();
    assert!(
        wait_until(
            || state.opens() == 2 && manager.is_connected(),
            Duration::from_secs(5),
        )
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_terminal() {
    let state = BrokerState::new();
    let manager = manager_with(&state);
    manager.connect().await.unwrap();

    manager.disconnect().await;
    assert!(manager.is_terminated());

    // Neither explicit connects nor reconnect triggers revive it.
    assert!(manager.connect().await.is_err());
    assert!(!manager.request_reconnect().await);
    assert_eq!(state.opens(), 1);

    // Idempotent.
    manager.disconnect().await;
    assert!(manager.is_terminated());
}
