//! Broker-backed server wiring subscriptions to a managed lifecycle
//!
//! `BusServer` owns a broker plus a set of registered subscriptions and
//! drives them through `start`/`stop`. Subscriptions registered before
//! `start` are deferred until the broker connects; registrations while
//! running subscribe immediately. `stop` disconnects the broker, which
//! closes every live subscription, while the registrations survive for
//! the next `start`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerState, Subscriber};
use crate::error::Result;
use crate::handler::{Binder, Handler};
use crate::metrics::MetricsSnapshot;
use crate::options::SubscribeOptions;

/// One registered subscription, kept for replay across restarts
struct SubscriptionSpec {
    topic: String,
    handler: Handler,
    binder: Option<Binder>,
    opts: SubscribeOptions,
}

/// Managed pub/sub server over one broker
pub struct BusServer {
    broker: Arc<dyn Broker>,

    /// Registered subscriptions; never drained, so `start` can replay them
    specs: Mutex<Vec<SubscriptionSpec>>,

    /// Handles for the currently live subscriptions
    active: Mutex<Vec<Arc<dyn Subscriber>>>,

    started: AtomicBool,
}

impl BusServer {
    /// Create a server over a broker
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            specs: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// The wrapped broker
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Whether `start` has completed and `stop` has not
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Register a subscription
    ///
    /// Before `start`, registration is deferred until the broker connects.
    /// While running, the subscription starts immediately and an error
    /// leaves the registration unrecorded.
    pub async fn register_subscriber(
        &self,
        topic: impl Into<String>,
        handler: Handler,
        binder: Option<Binder>,
        opts: SubscribeOptions,
    ) -> Result<()> {
        let spec = SubscriptionSpec {
            topic: topic.into(),
            handler,
            binder,
            opts,
        };

        if self.is_running() {
            let sub = self
                .broker
                .subscribe(
                    &spec.topic,
                    spec.handler.clone(),
                    spec.binder.clone(),
                    spec.opts.clone(),
                )
                .await?;
            self.active.lock().await.push(sub);
        }

        debug!(topic = %spec.topic, "subscription registered with server");
        self.specs.lock().await.push(spec);
        Ok(())
    }

    /// Initialize the broker if needed, connect, and start every
    /// registered subscription
    ///
    /// Idempotent; a second `start` without an intervening `stop` is a
    /// no-op. On failure no subscription from this call stays live.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self.try_start().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    async fn try_start(&self) -> Result<()> {
        if self.broker.state() == BrokerState::Uninitialized {
            self.broker.init(vec![]).await?;
        }
        self.broker.connect().await?;

        let specs = self.specs.lock().await;
        let mut active = self.active.lock().await;
        for spec in specs.iter() {
            let subscribed = self
                .broker
                .subscribe(
                    &spec.topic,
                    spec.handler.clone(),
                    spec.binder.clone(),
                    spec.opts.clone(),
                )
                .await;
            match subscribed {
                Ok(sub) => active.push(sub),
                Err(err) => {
                    for sub in active.drain(..) {
                        let _ = sub.unsubscribe().await;
                    }
                    return Err(err);
                }
            }
        }

        info!(
            broker = self.broker.name(),
            subscriptions = active.len(),
            "bus server started"
        );
        Ok(())
    }

    /// Disconnect the broker and close every live subscription
    ///
    /// Registered subscriptions are kept and replay on the next `start`.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.broker.disconnect().await?;
        self.active.lock().await.clear();

        info!(broker = self.broker.name(), "bus server stopped");
        Ok(())
    }

    /// Delivery/publish counters from the underlying broker, if recorded
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.broker.metrics()
    }
}
