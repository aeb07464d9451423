//! Broker trait — the core abstraction for pub/sub backends
//!
//! All backends (NATS, in-memory, etc.) implement `Broker` to provide a
//! uniform API for lifecycle, publish, and subscribe. Application code and
//! the `BusServer` only ever talk to this trait.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::{BrokerError, Result};
use crate::handler::{Binder, Handler};
use crate::message::Payload;
use crate::metrics::MetricsSnapshot;
use crate::options::{BrokerOption, BrokerOptions, PublishOptions, SubscribeOptions};

/// Lifecycle state of a broker
///
/// Every backend adapter implements the same machine:
/// `Uninitialized -> Initialized -> Connected -> Disconnected`, with
/// `Disconnected` re-enterable via `init`/`connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, options seeded but not yet resolved
    Uninitialized,
    /// Options resolved; no live session
    Initialized,
    /// Live backend session established
    Connected,
    /// Session released; may be re-initialized or re-connected
    Disconnected,
}

impl BrokerState {
    /// Check that `init` is allowed from this state
    pub fn ensure_can_init(self) -> Result<()> {
        match self {
            BrokerState::Uninitialized | BrokerState::Disconnected => Ok(()),
            state => Err(BrokerError::InvalidState { op: "init", state }),
        }
    }

    /// Check that `connect` is allowed from this state
    ///
    /// `Connected` is not an error here; adapters treat it as an idempotent
    /// no-op before calling this.
    pub fn ensure_can_connect(self) -> Result<()> {
        match self {
            BrokerState::Initialized | BrokerState::Disconnected => Ok(()),
            state => Err(BrokerError::InvalidState {
                op: "connect",
                state,
            }),
        }
    }

    /// Check that a publish/subscribe operation is allowed from this state
    pub fn ensure_connected(self, op: &'static str) -> Result<()> {
        match self {
            BrokerState::Connected => Ok(()),
            state => Err(BrokerError::InvalidState { op, state }),
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerState::Uninitialized => "uninitialized",
            BrokerState::Initialized => "initialized",
            BrokerState::Connected => "connected",
            BrokerState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Core trait for pub/sub backends
///
/// Implementations own exactly one backend session and the set of live
/// subscriptions created through it. All methods take `&self`; adapters use
/// interior mutability so one broker can be shared across tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend identifier (e.g., "nats", "memory")
    fn name(&self) -> &'static str;

    /// First resolved address, or an empty string before resolution
    fn address(&self) -> String;

    /// Snapshot of the current options, for inspection
    fn options(&self) -> BrokerOptions;

    /// Current lifecycle state
    fn state(&self) -> BrokerState;

    /// Apply option mutators in order and resolve backend defaults
    ///
    /// Valid only in `Uninitialized` or `Disconnected` state. Mutators are
    /// applied on top of the current options and the result is installed
    /// atomically; fields no mutator touches keep their prior value.
    async fn init(&self, opts: Vec<BrokerOption>) -> Result<()>;

    /// Establish the backend session
    ///
    /// Idempotent: connecting an already-connected broker is a no-op
    /// success. A failed connect leaves the broker `Initialized` with no
    /// partial session.
    async fn connect(&self) -> Result<()>;

    /// Release the backend session and close every live subscriber
    ///
    /// Valid from any state and idempotent; a never-connected broker
    /// disconnects successfully.
    async fn disconnect(&self) -> Result<()>;

    /// Publish one message to a topic
    ///
    /// Raw payloads pass through untouched; typed payloads are marshaled
    /// with the configured codec, and a typed payload without a codec is a
    /// configuration error. Safe to call concurrently.
    async fn publish(&self, topic: &str, payload: Payload, opts: PublishOptions) -> Result<()>;

    /// Register a subscription and start its delivery loop
    ///
    /// `binder` produces a fresh decode target per inbound message; `None`
    /// selects raw-bytes mode. Returns an error without registering anything
    /// if the codec is unresolvable or the broker is not connected.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        binder: Option<Binder>,
        opts: SubscribeOptions,
    ) -> Result<Arc<dyn Subscriber>>;

    /// Delivery/publish counters, if the adapter records them
    fn metrics(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Handle to one active subscription
///
/// Returned by `Broker::subscribe`; readable from any task. Closing is
/// idempotent and `closed` is terminal.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Topic this subscription listens on
    fn topic(&self) -> &str;

    /// Queue/consumer-group name, if the subscription competes in one
    fn queue(&self) -> Option<&str>;

    /// Whether the subscription has been closed
    fn is_closed(&self) -> bool;

    /// Stop delivery and release backend resources
    ///
    /// After this returns, the handler is not invoked again even if
    /// messages keep arriving on the topic. Re-closing is a no-op.
    async fn unsubscribe(&self) -> Result<()>;
}

impl fmt::Debug for dyn Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic())
            .field("queue", &self.queue())
            .field("closed", &self.is_closed())
            .finish()
    }
}
