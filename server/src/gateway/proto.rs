//! Generated wire types for `proto/sovereign/v1/envelope.proto`, compiled at
//! build time by `build.rs` via `prost-build` -- the same codegen shape
//! `phnx-im-infra`'s `protos` crate uses for its own wire types.
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/sovereign.v1.rs"));

use prost::Message as _;

/// Encodes an envelope to its wire form (a single binary transport frame).
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

/// Decodes a wire frame into an envelope; malformed bytes map to
/// `prost::DecodeError`, which the gateway treats as `InvalidEnvelope`.
pub fn decode(bytes: &[u8]) -> Result<Envelope, prost::DecodeError> {
    Envelope::decode(bytes)
}

pub fn envelope(message_type: MessageType, request_id: &str, payload: impl prost::Message) -> Envelope {
    Envelope {
        r#type: message_type as i32,
        request_id: request_id.to_string(),
        payload: payload.encode_to_vec(),
    }
}

pub fn server_envelope(message_type: MessageType, payload: impl prost::Message) -> Envelope {
    envelope(message_type, "", payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_encode_decode() {
        let ping = Ping { timestamp_us: 12345 };
        let original = envelope(MessageType::Ping, "req-1", ping);
        let bytes = encode(&original);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn malformed_bytes_fail_to_decode() {
        let garbage = vec![0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(decode(&garbage).is_err());
    }
}
