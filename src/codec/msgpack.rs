//! MessagePack codec backed by rmp-serde

use crate::codec::{Codec, DecodeTarget};
use crate::error::{BrokerError, Result};

/// Compact binary codec, registered as `"msgpack"`
///
/// Structs are encoded with field names (`to_vec_named`) so payloads stay
/// readable by consumers in other languages and tolerate field reordering.
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn marshal(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(&value).map_err(|e| BrokerError::Encode {
            codec: "msgpack".to_string(),
            reason: e.to_string(),
        })
    }

    fn unmarshal(&self, body: &[u8], target: &mut dyn DecodeTarget) -> Result<()> {
        let mut de = rmp_serde::Deserializer::new(body);
        let mut erased = <dyn erased_serde::Deserializer>::erase(&mut de);
        target.load(&mut erased).map_err(|e| BrokerError::Decode {
            codec: "msgpack".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::typed_binder;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: u32,
        label: String,
    }

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        let codec = MsgpackCodec;
        let bytes = codec
            .marshal(&Sample {
                id: 9,
                label: "compact".to_string(),
            })
            .unwrap();

        let binder = typed_binder::<Sample>();
        let mut target = binder();
        codec.unmarshal(&bytes, target.as_mut()).unwrap();
        let sample = target.take().unwrap().downcast::<Sample>().unwrap();
        assert_eq!(sample.id, 9);
        assert_eq!(sample.label, "compact");
    }

    #[test]
    fn test_json_bytes_are_not_msgpack() {
        let codec = MsgpackCodec;
        let binder = typed_binder::<Sample>();
        let mut target = binder();
        let err = codec
            .unmarshal(b"{\"id\":9,\"label\":\"compact\"}", target.as_mut())
            .unwrap_err();
        assert!(matches!(err, BrokerError::Decode { codec, .. } if codec == "msgpack"));
    }
}
