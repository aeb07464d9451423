//! Error types for polybus

use thiserror::Error;

use crate::broker::BrokerState;

/// Errors that can occur across the broker abstraction
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted in a broker state that does not allow it
    #[error("Cannot {op} in broker state '{state}'")]
    InvalidState {
        op: &'static str,
        state: BrokerState,
    },

    /// Publish failure
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Codec failed to marshal an outbound payload
    #[error("Codec '{codec}' failed to encode payload: {reason}")]
    Encode { codec: String, reason: String },

    /// Codec failed to unmarshal an inbound payload
    #[error("Codec '{codec}' failed to decode payload: {reason}")]
    Decode { codec: String, reason: String },

    /// Codec name not present in the registry
    #[error("Codec not registered: {0}")]
    CodecNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Application handler failure, forwarded to the backend's ack policy
    #[error("Handler error: {0}")]
    Handler(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Internal invariant failure (poisoned lock, closed channel)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
