//! Broker, subscription, and publish options
//!
//! Broker-level options are composed from ordered mutator functions applied
//! to a defaulted base; later mutators override earlier ones for the fields
//! they touch, and the same mutator list produces the same state whether it
//! is passed at construction time or to `init`. Backend-specific options
//! travel in a type-erased extension bag that only the owning adapter
//! interprets.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::codec::{get_codec, Codec};
use crate::error::Result;
use crate::message::Headers;

/// Type-erased bag of backend-specific option values, keyed by type
///
/// One value per concrete type; inserting the same type twice replaces the
/// earlier value. Values are `Arc`-shared so option snapshots stay cheap to
/// clone.
#[derive(Clone, Default)]
pub struct Extensions {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Insert a value, replacing any previous value of the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Borrow the stored value of type `T`, if present
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Whether the bag holds any values
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Broker-level configuration
///
/// Immutable once installed by `init`; brokers hand out clones for
/// inspection rather than references into their own state.
#[derive(Debug, Clone, Default)]
pub struct BrokerOptions {
    /// Backend endpoints, one string per address
    ///
    /// Empty until the adapter's `init` resolves its default.
    pub addrs: Vec<String>,

    /// Codec name resolved through the registry; `None` = raw-bytes mode
    pub codec: Option<String>,

    /// Governs the lifetime of broker-level blocking operations
    pub context: CancellationToken,

    /// Backend-specific options (e.g., `NatsOptions`)
    pub ext: Extensions,
}

impl BrokerOptions {
    /// Apply mutators in order; later mutators win per field
    pub fn apply(&mut self, opts: Vec<BrokerOption>) {
        for opt in opts {
            opt(self);
        }
    }

    /// Build options from defaults plus a mutator list
    pub fn from_options(opts: Vec<BrokerOption>) -> Self {
        let mut base = Self::default();
        base.apply(opts);
        base
    }

    /// Resolve the configured codec through the registry
    ///
    /// `Ok(None)` means raw-bytes mode; an unregistered name is a
    /// configuration error surfaced here, at the call that needs it.
    pub fn resolve_codec(&self) -> Result<Option<Arc<dyn Codec>>> {
        match &self.codec {
            Some(name) => Ok(Some(get_codec(name)?)),
            None => Ok(None),
        }
    }
}

/// A single broker-option mutator
pub type BrokerOption = Box<dyn FnOnce(&mut BrokerOptions) + Send>;

/// Replace the address list
pub fn with_address<I, S>(addrs: I) -> BrokerOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
    Box::new(move |opts| opts.addrs = addrs)
}

/// Select a codec by registry name
pub fn with_codec(name: impl Into<String>) -> BrokerOption {
    let name = name.into();
    Box::new(move |opts| opts.codec = Some(name))
}

/// Set the cancellation context for broker-level operations
pub fn with_context(token: CancellationToken) -> BrokerOption {
    Box::new(move |opts| opts.context = token)
}

/// Stash a backend-specific options value in the extension bag
pub fn with_ext<T: Any + Send + Sync>(value: T) -> BrokerOption {
    Box::new(move |opts| opts.ext.insert(value))
}

/// Per-subscription configuration
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Queue/consumer-group name; `None` = every subscriber gets a copy
    pub queue: Option<String>,

    /// Resolve disposition from the handler result (`true`, default) or
    /// hand the handler an `AckHandle` (`false`)
    pub auto_ack: bool,

    /// Governs the subscription's delivery loop; canceling stops delivery
    pub context: CancellationToken,

    /// Backend-specific options
    pub ext: Extensions,
}

impl SubscribeOptions {
    /// Create subscription options with auto-ack enabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the named queue group; members compete for each message
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    /// Hand the handler an `AckHandle` instead of resolving disposition
    /// from its return value
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    /// Set the cancellation token governing the delivery loop
    pub fn context(mut self, token: CancellationToken) -> Self {
        self.context = token;
        self
    }

    /// Stash a backend-specific options value in the extension bag
    pub fn ext<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.ext.insert(value);
        self
    }

    /// Queue name with the empty string normalized to `None` (ungrouped)
    pub fn effective_queue(&self) -> Option<&str> {
        self.queue.as_deref().filter(|q| !q.is_empty())
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
            context: CancellationToken::new(),
            ext: Extensions::default(),
        }
    }
}

/// Per-publish configuration
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Headers copied into the outbound envelope
    pub headers: Headers,

    /// Backend-specific options
    pub ext: Extensions,
}

impl PublishOptions {
    /// Create publish options with no headers
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a header to the outbound envelope
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Stash a backend-specific options value in the extension bag
    pub fn ext<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.ext.insert(value);
        self
    }
}
