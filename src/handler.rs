//! Typed handler adapter and the shared dispatch pipeline
//!
//! Backends deliver raw envelopes; applications want strongly-typed
//! callbacks. `typed_binder` + `typed_handler` bridge the two with closure
//! capture at registration time: the binder produces a fresh decode target
//! per inbound message, the dispatch pipeline unmarshals into it through
//! the broker's codec, and the typed callback only runs when decoding
//! succeeded. The same handler works unmodified against every backend.

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::codec::{Codec, DecodeTarget};
use crate::error::{BrokerError, Result};
use crate::message::{AckHandle, Delivery, Headers, Message};
use crate::metrics::BrokerMetrics;

/// Generic per-message callback, the dispatch signature of the broker
/// contract
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Factory producing a fresh decode target per inbound message
///
/// Pass `None` to `subscribe` for raw-bytes mode.
pub type Binder = Arc<dyn Fn() -> Box<dyn DecodeTarget> + Send + Sync>;

/// Decode target holding one value of a known type
struct BodySlot<T> {
    value: Option<T>,
}

impl<T> DecodeTarget for BodySlot<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn load(
        &mut self,
        de: &mut dyn erased_serde::Deserializer<'_>,
    ) -> std::result::Result<(), erased_serde::Error> {
        self.value = Some(erased_serde::deserialize(de)?);
        Ok(())
    }

    fn take(self: Box<Self>) -> Option<Box<dyn Any + Send + Sync>> {
        self.value.map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)
    }
}

/// Binder for payloads deserializing into `T`
pub fn typed_binder<T>() -> Binder
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(|| Box::new(BodySlot::<T> { value: None }))
}

/// Wrap a typed async callback `(topic, headers, body)` into a generic
/// `Handler`
///
/// The callback runs once per successfully decoded message with the
/// populated value; a delivery that carries no decoded `T` is rejected
/// without invoking it. Intended for auto-ack subscriptions — manual-ack
/// handlers work with `Delivery` directly to reach the `AckHandle`.
pub fn typed_handler<T, F, Fut>(f: F) -> Handler
where
    T: Send + Sync + 'static,
    F: Fn(String, Headers, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(
        move |mut delivery: Delivery| -> BoxFuture<'static, Result<()>> {
            match delivery.message.take_decoded::<T>() {
                Some(body) => {
                    let headers = std::mem::take(&mut delivery.message.headers);
                    Box::pin(f(delivery.topic, headers, body))
                }
                None => Box::pin(std::future::ready(Err(BrokerError::Config(format!(
                    "typed handler for {} received no decoded body; subscribe with a matching typed_binder",
                    std::any::type_name::<T>()
                ))))),
            }
        },
    )
}

/// Wrap an async callback `(topic, headers, body)` over the undecoded body
/// into a generic `Handler`
pub fn raw_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(String, Headers, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(
        move |mut delivery: Delivery| -> BoxFuture<'static, Result<()>> {
            let headers = std::mem::take(&mut delivery.message.headers);
            Box::pin(f(delivery.topic, headers, delivery.message.body))
        },
    )
}

/// Pair a binder with the broker's codec at subscribe time
///
/// A binder without a codec is a configuration error here, before any
/// subscription is registered. A codec without a binder is fine — the
/// subscription runs in raw-bytes mode.
pub(crate) fn bind_codec(
    topic: &str,
    binder: Option<Binder>,
    codec: Option<Arc<dyn Codec>>,
) -> Result<Option<(Binder, Arc<dyn Codec>)>> {
    match (binder, codec) {
        (Some(binder), Some(codec)) => Ok(Some((binder, codec))),
        (Some(_), None) => Err(BrokerError::Config(format!(
            "typed subscription to '{topic}' requires a codec; configure one with with_codec(..)"
        ))),
        (None, _) => Ok(None),
    }
}

/// Counter-only ack handle for backends without broker-level
/// acknowledgement (at-most-once delivery)
pub(crate) fn counter_ack(metrics: Arc<BrokerMetrics>) -> AckHandle {
    let nack_metrics = metrics.clone();
    AckHandle::new(
        move || {
            Box::pin(async move {
                metrics.incr_acked();
                Ok(())
            })
        },
        move || {
            Box::pin(async move {
                nack_metrics.incr_nacked();
                Ok(())
            })
        },
    )
}

/// Decode → invoke → disposition pipeline shared by every backend's
/// delivery loop
pub(crate) struct Dispatcher {
    handler: Handler,
    decode: Option<(Binder, Arc<dyn Codec>)>,
    auto_ack: bool,
    metrics: Arc<BrokerMetrics>,
}

impl Dispatcher {
    pub(crate) fn new(
        handler: Handler,
        decode: Option<(Binder, Arc<dyn Codec>)>,
        auto_ack: bool,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            handler,
            decode,
            auto_ack,
            metrics,
        }
    }

    /// Process one inbound message; never fails the loop
    ///
    /// Decode failures and handler errors affect only this message's
    /// disposition.
    pub(crate) async fn dispatch(&self, topic: &str, headers: Headers, body: Bytes, ack: AckHandle) {
        let mut message = Message::new(headers, body);

        if let Some((binder, codec)) = &self.decode {
            let mut target = binder();
            if let Err(err) = codec.unmarshal(&message.body, target.as_mut()) {
                self.reject(topic, err, ack).await;
                return;
            }
            match target.take() {
                Some(value) => message.set_decoded(value),
                None => {
                    let err = BrokerError::Decode {
                        codec: codec.name().to_string(),
                        reason: "decoder produced no value".to_string(),
                    };
                    self.reject(topic, err, ack).await;
                    return;
                }
            }
        }

        let (handle, retained) = if self.auto_ack {
            (None, Some(ack))
        } else {
            (Some(ack), None)
        };
        let delivery = Delivery::new(topic.to_string(), message, handle);
        let result = (self.handler)(delivery).await;
        self.metrics.incr_delivered();

        match result {
            Ok(()) => {
                if let Some(ack) = retained {
                    if let Err(err) = ack.ack().await {
                        warn!(topic = %topic, error = %err, "ack failed");
                    }
                }
            }
            Err(err) => {
                self.metrics.incr_handler_errors();
                warn!(topic = %topic, error = %err, "handler returned error");
                if let Some(ack) = retained {
                    if let Err(err) = ack.nack().await {
                        warn!(topic = %topic, error = %err, "nack failed");
                    }
                }
            }
        }
    }

    async fn reject(&self, topic: &str, err: BrokerError, ack: AckHandle) {
        self.metrics.incr_decode_errors();
        warn!(topic = %topic, error = %err, "dropping undecodable message");
        if let Err(err) = ack.nack().await {
            warn!(topic = %topic, error = %err, "nack failed");
        }
    }
}
