//! Public error types for the agent facade.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The process-wide facade was used before `BillingAgent::init`.
    #[error("billing agent is not initialized; call BillingAgent::init first")]
    Uninitialized,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
