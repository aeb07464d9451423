//! Message envelope and payload types
//!
//! A `Message` is the wire-agnostic representation of one inbound delivery:
//! a header map, the raw body bytes, and (for typed subscriptions) the
//! decoded object. It is created per delivery, owned by the dispatch call
//! that produced it, and discarded after the handler returns.

use bytes::Bytes;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::{BrokerError, Result};

/// Header mapping carried alongside every message body
pub type Headers = HashMap<String, String>;

/// One inbound message as seen by handlers
pub struct Message {
    /// Transport headers (string -> string)
    pub headers: Headers,

    /// Raw body bytes as received from the backend
    pub body: Bytes,

    /// Decoded body, populated by the dispatch pipeline for typed
    /// subscriptions
    decoded: Option<Box<dyn Any + Send + Sync>>,
}

impl Message {
    /// Create an envelope with no decoded body
    pub fn new(headers: Headers, body: Bytes) -> Self {
        Self {
            headers,
            body,
            decoded: None,
        }
    }

    /// Attach the decoded body after a successful unmarshal
    pub fn set_decoded(&mut self, value: Box<dyn Any + Send + Sync>) {
        self.decoded = Some(value);
    }

    /// Whether a decoded body is present
    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }

    /// Borrow the decoded body as `T`
    pub fn decoded_ref<T: 'static>(&self) -> Option<&T> {
        self.decoded.as_deref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Take ownership of the decoded body as `T`
    ///
    /// Returns `None` (leaving the slot untouched) if nothing was decoded
    /// or the type does not match.
    pub fn take_decoded<T: 'static>(&mut self) -> Option<T> {
        match self.decoded.take() {
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(v) => Some(*v),
                Err(other) => {
                    self.decoded = Some(other);
                    None
                }
            },
            None => None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("decoded", &self.decoded.is_some())
            .finish()
    }
}

/// Outbound payload: raw bytes pass through, typed values go through the
/// configured codec's `marshal`
pub enum Payload {
    /// Pre-encoded bytes, handed to the backend untouched
    Raw(Bytes),
    /// A value to marshal with the broker's codec at publish time
    Typed(Box<dyn erased_serde::Serialize + Send + Sync>),
}

impl Payload {
    /// Wrap already-encoded bytes
    pub fn raw(body: impl Into<Bytes>) -> Self {
        Payload::Raw(body.into())
    }

    /// Wrap a serializable value for codec marshaling
    pub fn typed<T>(value: T) -> Self
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        Payload::Typed(Box::new(value))
    }
}

impl From<Bytes> for Payload {
    fn from(body: Bytes) -> Self {
        Payload::Raw(body)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(body: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(body))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(body: &'static [u8]) -> Self {
        Payload::Raw(Bytes::from_static(body))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Raw(body) => f.debug_tuple("Raw").field(&body.len()).finish(),
            Payload::Typed(_) => f.write_str("Typed(..)"),
        }
    }
}

/// Turn a payload into wire bytes, marshaling typed values through the
/// broker's codec
///
/// Raw bytes bypass the codec entirely; a typed payload with no codec is a
/// configuration error.
pub(crate) fn encode_payload(
    topic: &str,
    payload: Payload,
    codec: Option<Arc<dyn Codec>>,
) -> Result<Bytes> {
    match payload {
        Payload::Raw(body) => Ok(body),
        Payload::Typed(value) => {
            let codec = codec.ok_or_else(|| {
                BrokerError::Config(format!(
                    "typed publish to '{topic}' requires a codec; configure one with with_codec(..)"
                ))
            })?;
            Ok(Bytes::from(codec.marshal(value.as_ref())?))
        }
    }
}

/// Manual acknowledgement control for one delivery
///
/// Handed to handlers on subscriptions created with `auto_ack = false`;
/// auto-ack subscriptions resolve disposition from the handler's return
/// value instead.
pub struct AckHandle {
    ack_fn: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
    nack_fn: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl AckHandle {
    /// Create a handle from ack/nack callbacks
    pub fn new(
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            ack_fn: Box::new(ack_fn),
            nack_fn: Box::new(nack_fn),
        }
    }

    /// Confirm processing of the delivery
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Reject the delivery, applying the backend's failure policy
    pub async fn nack(self) -> Result<()> {
        (self.nack_fn)().await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckHandle")
    }
}

/// Everything a generic handler receives for one inbound message
#[derive(Debug)]
pub struct Delivery {
    /// Topic the message arrived on
    pub topic: String,

    /// The message envelope
    pub message: Message,

    /// Manual ack control; `None` on auto-ack subscriptions
    ack: Option<AckHandle>,
}

impl Delivery {
    /// Create a delivery; `ack` is `Some` only in manual-ack mode
    pub fn new(topic: String, message: Message, ack: Option<AckHandle>) -> Self {
        Self {
            topic,
            message,
            ack,
        }
    }

    /// Take the manual ack handle, if this subscription uses one
    pub fn take_ack(&mut self) -> Option<AckHandle> {
        self.ack.take()
    }
}
