//! Codec contract and process-wide registry
//!
//! A `Codec` is a named marshal/unmarshal pair. Brokers resolve codecs by
//! name from the registry at publish/subscribe time, so application code
//! picks a wire format with a string (`with_codec("json")`) and the core
//! never hardcodes any format's encoding rules.

use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{BrokerError, Result};

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

/// A decode destination produced fresh per inbound message
///
/// Binders hand one of these to the codec; on success the decoded value is
/// extracted with `take` and attached to the message envelope.
pub trait DecodeTarget: Send {
    /// Deserialize from the erased deserializer into this target
    fn load(
        &mut self,
        de: &mut dyn erased_serde::Deserializer<'_>,
    ) -> std::result::Result<(), erased_serde::Error>;

    /// Extract the decoded value; `None` if `load` never succeeded
    fn take(self: Box<Self>) -> Option<Box<dyn Any + Send + Sync>>;
}

/// Named serialize/deserialize strategy
///
/// Implementations must be pure: no state beyond configuration, safe to
/// share behind an `Arc` across every broker in the process.
pub trait Codec: Send + Sync {
    /// Registry name (e.g., "json", "msgpack")
    fn name(&self) -> &'static str;

    /// Encode a value to wire bytes
    fn marshal(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>>;

    /// Decode wire bytes into the supplied target
    fn unmarshal(&self, body: &[u8], target: &mut dyn DecodeTarget) -> Result<()>;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").field("name", &self.name()).finish()
    }
}

/// Process-wide codec registry, seeded with the built-in codecs
///
/// Read-heavy and write-rare: registration belongs in startup code, lookups
/// happen on every typed publish/subscribe.
static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn Codec>>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn Codec>> = HashMap::new();
    map.insert("json".to_string(), Arc::new(JsonCodec));
    map.insert("msgpack".to_string(), Arc::new(MsgpackCodec));
    RwLock::new(map)
});

/// Register a codec under its name, replacing any previous registration
///
/// Last write wins for a given name.
pub fn register_codec(codec: Arc<dyn Codec>) -> Result<()> {
    let mut registry = REGISTRY
        .write()
        .map_err(|e| BrokerError::Internal(format!("codec registry lock poisoned: {e}")))?;
    registry.insert(codec.name().to_string(), codec);
    Ok(())
}

/// Look up a codec by name
pub fn get_codec(name: &str) -> Result<Arc<dyn Codec>> {
    let registry = REGISTRY
        .read()
        .map_err(|e| BrokerError::Internal(format!("codec registry lock poisoned: {e}")))?;
    registry
        .get(name)
        .cloned()
        .ok_or_else(|| BrokerError::CodecNotFound(name.to_string()))
}
