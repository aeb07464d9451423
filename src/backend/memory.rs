//! In-process backend adapter
//!
//! Delivers within one process with pub/sub semantics matching the remote
//! adapters: ungrouped subscribers each receive every message on their
//! topic, subscribers sharing a queue group compete round-robin. Useful as
//! an application backend for single-process deployments and as the test
//! double for everything built on the `Broker` trait.
//!
//! Delivery is at-most-once: each subscriber has a bounded buffer and a
//! message that finds it full is dropped and counted, never retried.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerState, Subscriber};
use crate::error::{BrokerError, Result};
use crate::handler::{bind_codec, counter_ack, Binder, Dispatcher, Handler};
use crate::message::{encode_payload, Headers, Payload};
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::options::{BrokerOption, BrokerOptions, PublishOptions, SubscribeOptions};

/// Address reported when none is configured
const DEFAULT_ADDRESS: &str = "memory://local";

/// Per-subscriber buffer size when `MemoryOptions` is absent
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Backend-specific options, stashed in the broker's extension bag with
/// `with_ext(MemoryOptions { .. })`
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Buffered frames per subscriber before publishes start dropping
    pub channel_capacity: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// One frame queued toward a subscriber
#[derive(Clone)]
struct Frame {
    headers: Headers,
    body: Bytes,
}

/// A subscriber's inbound channel endpoint
struct MemberTx {
    id: Uuid,
    tx: mpsc::Sender<Frame>,
}

/// Members competing for messages within one queue group
#[derive(Default)]
struct QueueGroup {
    members: Vec<MemberTx>,
    cursor: AtomicUsize,
}

/// All delivery targets for one topic
#[derive(Default)]
struct TopicChannels {
    fanout: Vec<MemberTx>,
    groups: HashMap<String, QueueGroup>,
}

/// State and options, guarded together so transitions observe the options
/// they were checked against
struct Inner {
    state: BrokerState,
    opts: BrokerOptions,
}

struct Shared {
    inner: RwLock<Inner>,
    topics: tokio::sync::RwLock<HashMap<String, TopicChannels>>,
    subs: tokio::sync::RwLock<HashMap<Uuid, Arc<MemorySubscriber>>>,
    metrics: Arc<BrokerMetrics>,
}

impl Shared {
    // a poisoned lock only means a writer panicked; the data stays valid
    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process `Broker` implementation
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create a broker with constructor-time option mutators
    pub fn new(opts: Vec<BrokerOption>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    state: BrokerState::Uninitialized,
                    opts: BrokerOptions::from_options(opts),
                }),
                topics: tokio::sync::RwLock::new(HashMap::new()),
                subs: tokio::sync::RwLock::new(HashMap::new()),
                metrics: Arc::new(BrokerMetrics::default()),
            }),
        }
    }

    async fn publish_frame(&self, topic: &str, payload: Payload, opts: PublishOptions) -> Result<()> {
        {
            let inner = self.shared.read_inner();
            inner.state.ensure_connected("publish")?;
        }

        let body = match payload {
            Payload::Raw(body) => body,
            typed => {
                let codec = { self.shared.read_inner().opts.resolve_codec()? };
                encode_payload(topic, typed, codec)?
            }
        };

        let frame = Frame {
            headers: opts.headers,
            body,
        };

        let topics = self.shared.topics.read().await;
        if let Some(channels) = topics.get(topic) {
            for member in &channels.fanout {
                if member.tx.try_send(frame.clone()).is_err() {
                    self.shared.metrics.incr_dropped();
                    warn!(topic = %topic, subscriber = %member.id, "subscriber buffer full, dropping message");
                }
            }
            for (name, group) in &channels.groups {
                let count = group.members.len();
                if count == 0 {
                    continue;
                }
                let start = group.cursor.fetch_add(1, Ordering::Relaxed);
                let mut sent = false;
                for offset in 0..count {
                    let member = &group.members[(start + offset) % count];
                    if member.tx.try_send(frame.clone()).is_ok() {
                        sent = true;
                        break;
                    }
                }
                if !sent {
                    self.shared.metrics.incr_dropped();
                    warn!(topic = %topic, group = %name, "no queue member accepted message, dropping");
                }
            }
        }
        drop(topics);

        self.shared.metrics.incr_published();
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn address(&self) -> String {
        self.shared
            .read_inner()
            .opts
            .addrs
            .first()
            .cloned()
            .unwrap_or_default()
    }

    fn options(&self) -> BrokerOptions {
        self.shared.read_inner().opts.clone()
    }

    fn state(&self) -> BrokerState {
        self.shared.read_inner().state
    }

    async fn init(&self, opts: Vec<BrokerOption>) -> Result<()> {
        let mut inner = self.shared.write_inner();
        inner.state.ensure_can_init()?;

        let mut next = inner.opts.clone();
        next.apply(opts);
        if next.addrs.is_empty() {
            next.addrs = vec![DEFAULT_ADDRESS.to_string()];
        }
        inner.opts = next;
        inner.state = BrokerState::Initialized;
        drop(inner);

        debug!(address = %self.address(), "memory broker initialized");
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut inner = self.shared.write_inner();
            if inner.state == BrokerState::Connected {
                return Ok(());
            }
            inner.state.ensure_can_connect()?;
            if inner.opts.context.is_cancelled() {
                return Err(BrokerError::Connection(
                    "broker context cancelled".to_string(),
                ));
            }
            inner.state = BrokerState::Connected;
        }
        info!(address = %self.address(), "memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        {
            let mut inner = self.shared.write_inner();
            if inner.state == BrokerState::Disconnected {
                return Ok(());
            }
            inner.state = BrokerState::Disconnected;
        }

        let subs: Vec<Arc<MemorySubscriber>> =
            self.shared.subs.write().await.drain().map(|(_, s)| s).collect();
        for sub in subs {
            sub.finalize().await;
        }
        self.shared.topics.write().await.clear();

        info!("memory broker disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Payload, opts: PublishOptions) -> Result<()> {
        let result = self.publish_frame(topic, payload, opts).await;
        if result.is_err() {
            self.shared.metrics.incr_publish_errors();
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
        let (codec, capacity) = {
            let inner = self.shared.read_inner();
            inner.state.ensure_connected("subscribe")?;
            let codec = if binder.is_some() {
                inner.opts.resolve_codec()?
            } else {
                None
            };
            let capacity = inner
                .opts
                .ext
                .get::<MemoryOptions>()
                .map(|o| o.channel_capacity)
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
            (codec, capacity)
        };
        let decode = bind_codec(topic, binder, codec)?;

        let id = Uuid::new_v4();
        let queue = opts.effective_queue().map(str::to_string);
        let token = opts.context.child_token();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let sub = Arc::new(MemorySubscriber {
            id,
            topic: topic.to_string(),
            queue: queue.clone(),
            token: token.clone(),
            closed: AtomicBool::new(false),
            shared: Arc::downgrade(&self.shared),
        });

        {
            let mut topics = self.shared.topics.write().await;
            let channels = topics.entry(topic.to_string()).or_default();
            let member = MemberTx { id, tx };
            match &queue {
                Some(group) => channels
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .members
                    .push(member),
                None => channels.fanout.push(member),
            }
        }
        self.shared.subs.write().await.insert(id, sub.clone());

        let dispatcher = Dispatcher::new(handler, decode, opts.auto_ack, self.shared.metrics.clone());
        tokio::spawn(delivery_loop(
            sub.clone(),
            rx,
            dispatcher,
            self.shared.metrics.clone(),
        ));

        debug!(topic = %topic, subscriber = %id, queue = ?queue, "subscription registered");
        Ok(sub as Arc<dyn Subscriber>)
    }

    fn metrics(&self) -> Option<MetricsSnapshot> {
        Some(self.shared.metrics.snapshot())
    }
}

/// Handle to one in-process subscription
pub struct MemorySubscriber {
    id: Uuid,
    topic: String,
    queue: Option<String>,
    token: CancellationToken,
    closed: AtomicBool,
    shared: Weak<Shared>,
}

impl MemorySubscriber {
    /// Stop delivery, detach from the topic table, mark closed; idempotent
    async fn finalize(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        if let Some(shared) = self.shared.upgrade() {
            let mut topics = shared.topics.write().await;
            if let Some(channels) = topics.get_mut(&self.topic) {
                channels.fanout.retain(|m| m.id != self.id);
                if let Some(queue) = &self.queue {
                    if let Some(group) = channels.groups.get_mut(queue) {
                        group.members.retain(|m| m.id != self.id);
                        if group.members.is_empty() {
                            channels.groups.remove(queue);
                        }
                    }
                }
                if channels.fanout.is_empty() && channels.groups.is_empty() {
                    topics.remove(&self.topic);
                }
            }
            drop(topics);
            shared.subs.write().await.remove(&self.id);
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.finalize().await;
        Ok(())
    }
}

async fn delivery_loop(
    sub: Arc<MemorySubscriber>,
    mut rx: mpsc::Receiver<Frame>,
    dispatcher: Dispatcher,
    metrics: Arc<BrokerMetrics>,
) {
    loop {
        tokio::select! {
            biased;
            _ = sub.token.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let ack = counter_ack(metrics.clone());
                    dispatcher
                        .dispatch(&sub.topic, frame.headers, frame.body, ack)
                        .await;
                }
                None => break,
            }
        }
    }
    sub.finalize().await;
    debug!(topic = %sub.topic, subscriber = %sub.id, "delivery loop stopped");
}
