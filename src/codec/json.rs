//! JSON codec backed by serde_json

use crate::codec::{Codec, DecodeTarget};
use crate::error::{BrokerError, Result};

/// The default text codec, registered as `"json"`
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>> {
        serde_json::to_vec(&value).map_err(|e| BrokerError::Encode {
            codec: "json".to_string(),
            reason: e.to_string(),
        })
    }

    fn unmarshal(&self, body: &[u8], target: &mut dyn DecodeTarget) -> Result<()> {
        let mut de = serde_json::Deserializer::from_slice(body);
        let decode_err = |e: String| BrokerError::Decode {
            codec: "json".to_string(),
            reason: e,
        };
        {
            let mut erased = <dyn erased_serde::Deserializer>::erase(&mut de);
            target.load(&mut erased).map_err(|e| decode_err(e.to_string()))?;
        }
        // reject trailing garbage, matching strict from_slice semantics
        de.end().map_err(|e| decode_err(e.to_string()))
    }
}
