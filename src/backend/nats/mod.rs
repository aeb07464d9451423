//! NATS backend adapter
//!
//! Implements `Broker` over core NATS pub/sub. Ungrouped subscriptions
//! fan out; subscriptions sharing a queue name compete through NATS queue
//! groups. Delivery is at-most-once with no broker-side persistence, so
//! ack/nack only update counters.
//!
//! The server list resolves at `init` time: the common address list wins,
//! then `NatsOptions::servers`, then the driver default. Bare `host:port`
//! entries get the `nats://` scheme prefixed.

mod config;
mod subscriber;

pub use config::NatsOptions;
pub use subscriber::NatsSubscriber;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerState, Subscriber};
use crate::error::{BrokerError, Result};
use crate::handler::{bind_codec, Binder, Dispatcher, Handler};
use crate::message::{encode_payload, Headers, Payload};
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::options::{BrokerOption, BrokerOptions, PublishOptions, SubscribeOptions};

use config::{build_connect_options, resolve_addresses};
use subscriber::delivery_loop;

/// Registry of live subscriptions, shared weakly with their handles
type SubMap = tokio::sync::RwLock<HashMap<Uuid, Arc<NatsSubscriber>>>;

/// State and options, guarded together so transitions observe the options
/// they were checked against
struct Inner {
    state: BrokerState,
    opts: BrokerOptions,
}

/// Core NATS `Broker` implementation
pub struct NatsBroker {
    inner: RwLock<Inner>,
    client: tokio::sync::RwLock<Option<async_nats::Client>>,
    subs: Arc<SubMap>,
    metrics: Arc<BrokerMetrics>,
}

impl NatsBroker {
    /// Create a broker with constructor-time option mutators
    pub fn new(opts: Vec<BrokerOption>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: BrokerState::Uninitialized,
                opts: BrokerOptions::from_options(opts),
            }),
            client: tokio::sync::RwLock::new(None),
            subs: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            metrics: Arc::new(BrokerMetrics::default()),
        }
    }

    // a poisoned lock only means a writer panicked; the data stays valid
    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn publish_message(
        &self,
        topic: &str,
        payload: Payload,
        opts: PublishOptions,
    ) -> Result<()> {
        {
            self.read_inner().state.ensure_connected("publish")?;
        }

        let body = match payload {
            Payload::Raw(body) => body,
            typed => {
                let codec = { self.read_inner().opts.resolve_codec()? };
                encode_payload(topic, typed, codec)?
            }
        };

        let client = self.client.read().await;
        let client = client
            .as_ref()
            .ok_or_else(|| BrokerError::Connection("no live session".to_string()))?;

        if opts.headers.is_empty() {
            client.publish(topic.to_string(), body).await
        } else {
            client
                .publish_with_headers(topic.to_string(), to_header_map(&opts.headers), body)
                .await
        }
        .map_err(|e| BrokerError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        self.metrics.incr_published();
        Ok(())
    }
}

impl Default for NatsBroker {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> &'static str {
        "nats"
    }

    fn address(&self) -> String {
        self.read_inner()
            .opts
            .addrs
            .first()
            .cloned()
            .unwrap_or_default()
    }

    fn options(&self) -> BrokerOptions {
        self.read_inner().opts.clone()
    }

    fn state(&self) -> BrokerState {
        self.read_inner().state
    }

    async fn init(&self, opts: Vec<BrokerOption>) -> Result<()> {
        let mut inner = self.write_inner();
        inner.state.ensure_can_init()?;

        let mut next = inner.opts.clone();
        next.apply(opts);
        next.addrs = resolve_addresses(&next);
        inner.opts = next;
        inner.state = BrokerState::Initialized;
        drop(inner);

        debug!(address = %self.address(), "nats broker initialized");
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        let (addrs, native, token) = {
            let inner = self.read_inner();
            if inner.state == BrokerState::Connected {
                return Ok(());
            }
            inner.state.ensure_can_connect()?;
            (
                inner.opts.addrs.clone(),
                inner.opts.ext.get::<NatsOptions>().cloned(),
                inner.opts.context.clone(),
            )
        };

        if addrs.is_empty() {
            return Err(BrokerError::Config(
                "no address configured; call init first".to_string(),
            ));
        }

        // Holding the slot lock serializes concurrent connect attempts.
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let connecting = build_connect_options(native.as_ref()).connect(addrs.join(","));
        let client = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(BrokerError::Connection(
                    "broker context cancelled".to_string(),
                ));
            }
            result = connecting => result.map_err(|e| {
                BrokerError::Connection(format!("{}: {}", addrs.join(","), e))
            })?,
        };

        *slot = Some(client);
        self.write_inner().state = BrokerState::Connected;
        drop(slot);

        info!(address = %addrs.join(","), "connected to NATS");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Taking the slot lock first serializes against an in-flight connect,
        // so the state swap and the session teardown stay consistent.
        let mut slot = self.client.write().await;
        {
            let mut inner = self.write_inner();
            if inner.state == BrokerState::Disconnected {
                return Ok(());
            }
            inner.state = BrokerState::Disconnected;
        }

        let subs: Vec<Arc<NatsSubscriber>> = self
            .subs
            .write()
            .await
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in subs {
            sub.finalize().await;
        }

        if let Some(client) = slot.take() {
            if let Err(err) = client.flush().await {
                warn!(error = %err, "flush on disconnect failed");
            }
        }
        drop(slot);

        info!("nats broker disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Payload, opts: PublishOptions) -> Result<()> {
        let result = self.publish_message(topic, payload, opts).await;
        if result.is_err() {
            self.metrics.incr_publish_errors();
        }
        result
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        binder: Option<Binder>,
        opts: SubscribeOptions,
    ) -> Result<Arc<dyn Subscriber>> {
        let codec = {
            let inner = self.read_inner();
            inner.state.ensure_connected("subscribe")?;
            if binder.is_some() {
                inner.opts.resolve_codec()?
            } else {
                None
            }
        };
        let decode = bind_codec(topic, binder, codec)?;

        let queue = opts.effective_queue().map(str::to_string);
        let stream = {
            let client = self.client.read().await;
            let client = client
                .as_ref()
                .ok_or_else(|| BrokerError::Connection("no live session".to_string()))?;
            match &queue {
                Some(group) => {
                    client
                        .queue_subscribe(topic.to_string(), group.clone())
                        .await
                }
                None => client.subscribe(topic.to_string()).await,
            }
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?
        };

        let id = Uuid::new_v4();
        let sub = Arc::new(NatsSubscriber {
            id,
            topic: topic.to_string(),
            queue,
            token: opts.context.child_token(),
            closed: AtomicBool::new(false),
            subs: Arc::downgrade(&self.subs),
        });
        self.subs.write().await.insert(id, sub.clone());

        let dispatcher = Dispatcher::new(handler, decode, opts.auto_ack, self.metrics.clone());
        tokio::spawn(delivery_loop(
            sub.clone(),
            stream,
            dispatcher,
            self.metrics.clone(),
        ));

        debug!(topic = %topic, subscriber = %id, queue = ?sub.queue, "subscription registered");
        Ok(sub as Arc<dyn Subscriber>)
    }

    fn metrics(&self) -> Option<MetricsSnapshot> {
        Some(self.metrics.snapshot())
    }
}

/// Copy envelope headers into the driver's header map
fn to_header_map(headers: &Headers) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}
