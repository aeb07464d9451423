//! # polybus
//!
//! Unified publish/subscribe over pluggable messaging backends.
//!
//! ## Overview
//!
//! `polybus` provides a backend-agnostic `Broker` API for publishing,
//! subscribing, and typed message dispatch. Swap backends (NATS,
//! in-memory, etc.) without changing application code.
//!
//! ## Quick Start
//!
//! ```rust
//! use polybus::{typed_binder, typed_handler, with_codec};
//! use polybus::{Broker, MemoryBroker, Payload, PublishOptions, SubscribeOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! # async fn example() -> polybus::Result<()> {
//! let broker = MemoryBroker::new(vec![with_codec("json")]);
//! broker.init(vec![]).await?;
//! broker.connect().await?;
//!
//! broker
//!     .subscribe(
//!         "greetings",
//!         typed_handler(|topic, _headers, body: Greeting| async move {
//!             println!("{}: {}", topic, body.text);
//!             Ok(())
//!         }),
//!         Some(typed_binder::<Greeting>()),
//!         SubscribeOptions::default(),
//!     )
//!     .await?;
//!
//! broker
//!     .publish(
//!         "greetings",
//!         Payload::typed(Greeting { text: "hello".into() }),
//!         PublishOptions::default(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **memory** — in-process fanout and queue groups for testing and
//!   single-process use
//! - **nats** — core NATS pub/sub with queue-group competition
//!
//! ## Architecture
//!
//! - **Broker** trait — lifecycle, publish, subscribe; every backend
//!   implements it
//! - **Codec** trait + registry — pluggable payload serialization by name
//! - **typed_handler / typed_binder** — strongly-typed callbacks over the
//!   generic dispatch pipeline
//! - **BusServer** — start/stop lifecycle management over registered
//!   subscriptions

pub mod backend;
pub mod broker;
pub mod codec;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod options;
pub mod server;

// Re-export core types
pub use broker::{Broker, BrokerState, Subscriber};
pub use codec::{get_codec, register_codec, Codec, DecodeTarget, JsonCodec, MsgpackCodec};
pub use error::{BrokerError, Result};
pub use handler::{raw_handler, typed_binder, typed_handler, Binder, Handler};
pub use message::{AckHandle, Delivery, Headers, Message, Payload};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use options::{
    with_address, with_codec, with_context, with_ext, BrokerOption, BrokerOptions, Extensions,
    PublishOptions, SubscribeOptions,
};
pub use server::BusServer;

// Re-export backends for convenience
pub use backend::memory::{MemoryBroker, MemoryOptions};
pub use backend::nats::{NatsBroker, NatsOptions};
