//! NATS subscription handle and delivery loop

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::Subscriber;
use crate::error::Result;
use crate::handler::{counter_ack, Dispatcher};
use crate::message::Headers;
use crate::metrics::BrokerMetrics;

use super::SubMap;

/// Handle to one NATS subscription
pub struct NatsSubscriber {
    pub(super) id: Uuid,
    pub(super) topic: String,
    pub(super) queue: Option<String>,
    pub(super) token: CancellationToken,
    pub(super) closed: AtomicBool,
    pub(super) subs: Weak<SubMap>,
}

impl NatsSubscriber {
    /// Stop delivery, drop the registry entry, mark closed; idempotent
    pub(super) async fn finalize(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        if let Some(subs) = self.subs.upgrade() {
            subs.write().await.remove(&self.id);
        }
    }
}

#[async_trait]
impl Subscriber for NatsSubscriber {
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

/// Pull messages off the wire subscription until canceled or the stream
/// ends, then drop interest server-side
pub(super) async fn delivery_loop(
    sub: Arc<NatsSubscriber>,
    mut stream: async_nats::Subscriber,
    dispatcher: Dispatcher,
    metrics: Arc<BrokerMetrics>,
) {
    loop {
        tokio::select! {
            biased;
            _ = sub.token.cancelled() => break,
            msg = stream.next() => match msg {
                Some(msg) => {
                    let headers = convert_headers(msg.headers.as_ref());
                    let ack = counter_ack(metrics.clone());
                    dispatcher
                        .dispatch(&sub.topic, headers, msg.payload, ack)
                        .await;
                }
                None => break,
            }
        }
    }
    if let Err(err) = stream.unsubscribe().await {
        warn!(topic = %sub.topic, error = %err, "wire unsubscribe failed");
    }
    sub.finalize().await;
    debug!(topic = %sub.topic, subscriber = %sub.id, "delivery loop stopped");
}

/// Flatten driver headers into the envelope's string map; first value per
/// name wins
fn convert_headers(headers: Option<&async_nats::HeaderMap>) -> Headers {
    let mut map = Headers::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                map.insert(name.to_string(), value.to_string());
            }
        }
    }
    map
}
