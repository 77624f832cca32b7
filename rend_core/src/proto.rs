//! Wire protocol for `/rend/0.1.0`.
//!
//! A request is a single CBOR unsigned integer naming the message
//! type, followed by one CBOR body item. A response is one CBOR body
//! item with no tag; which shape to expect follows from the request.
//! Endpoint records travel inside bodies as opaque byte strings, so
//! the same canonical encoding covers records and messages alike.

use minicbor::bytes::ByteVec;
use minicbor::{CborLen, Decode, Encode};

/// ALPN identifier the protocol is served under.
pub const ALPN: &[u8] = b"/rend/0.1.0";

/// Upper bound on a single encoded request or response.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors from the wire codec.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    #[error("message encoding failed: {0}")]
    Encode(String),

    #[error("message decoding failed: {0}")]
    Decode(#[from] minicbor::decode::Error),

    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
}

/// Message type tags.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Register = 0x01,
    Discover = 0x02,
}

impl TryFrom<u64> for MessageType {
    type Error = ProtoError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Register),
            0x02 => Ok(MessageType::Discover),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }
}

/// Response status codes.
#[derive(Encode, Decode, CborLen, Clone, Copy, Debug, PartialEq, Eq)]
#[cbor(index_only)]
pub enum ResponseStatus {
    #[n(0)]
    Ok,
    /// The message body failed to decode.
    #[n(1)]
    InvalidContent,
    /// Topic missing or longer than the maximum.
    #[n(2)]
    InvalidNamespace,
    /// TTL exceeds the configured maximum.
    #[n(3)]
    InvalidTtl,
    /// Record is not signed.
    #[n(4)]
    InvalidRecord,
    /// Storage failure.
    #[n(5)]
    InternalError,
    /// Reserved; the server clamps oversized limits silently.
    #[n(6)]
    InvalidLimit,
}

/// Body of a `REGISTER` request.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct Register {
    #[n(0)]
    pub topic: String,

    /// Canonically encoded endpoint record, passed through opaquely.
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub record: Vec<u8>,

    /// Requested lifetime in nanoseconds.
    #[n(2)]
    pub ttl: u64,
}

/// Response to a `REGISTER` request.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct RegisterResponse {
    #[n(0)]
    pub status: ResponseStatus,
}

/// Body of a `DISCOVER` request.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct Discover {
    #[n(0)]
    pub topic: String,

    #[n(1)]
    pub limit: u64,
}

/// Response to a `DISCOVER` request.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct DiscoverResponse {
    #[n(0)]
    pub status: ResponseStatus,

    /// Canonically encoded endpoint records.
    #[n(1)]
    pub records: Vec<ByteVec>,
}

/// Encodes a tag followed by a request body, as sent by clients.
pub fn encode_request<T>(tag: MessageType, body: &T) -> Result<Vec<u8>, ProtoError>
where
    T: Encode<()>,
{
    let mut buf = Vec::new();
    minicbor::encode(&(tag as u64), &mut buf).map_err(|e| ProtoError::Encode(e.to_string()))?;
    minicbor::encode(body, &mut buf).map_err(|e| ProtoError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Encodes a bare response body.
pub fn encode_response<T>(body: &T) -> Result<Vec<u8>, ProtoError>
where
    T: Encode<()>,
{
    minicbor::to_vec(body).map_err(|e| ProtoError::Encode(e.to_string()))
}

/// Decodes a bare response body.
pub fn decode_response<T>(bytes: &[u8]) -> Result<T, ProtoError>
where
    T: for<'b> Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_starts_with_the_tag() {
        let body = Discover {
            topic: "t".into(),
            limit: 5,
        };
        let buf = encode_request(MessageType::Discover, &body).unwrap();

        let mut dec = minicbor::Decoder::new(&buf);
        assert_eq!(dec.u64().unwrap(), 0x02);
        let decoded: Discover = dec.decode().unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn register_round_trip() {
        let body = Register {
            topic: "any".into(),
            record: vec![1, 2, 3],
            ttl: 5_000_000_000,
        };
        let buf = encode_request(MessageType::Register, &body).unwrap();
        let mut dec = minicbor::Decoder::new(&buf);
        assert_eq!(
            MessageType::try_from(dec.u64().unwrap()).unwrap(),
            MessageType::Register
        );
        assert_eq!(dec.decode::<Register>().unwrap(), body);
    }

    #[test]
    fn response_round_trip() {
        let resp = DiscoverResponse {
            status: ResponseStatus::Ok,
            records: vec![ByteVec::from(vec![9, 9]), ByteVec::from(vec![8])],
        };
        let buf = encode_response(&resp).unwrap();
        let decoded: DiscoverResponse = decode_response(&buf).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(matches!(
            MessageType::try_from(0x09),
            Err(ProtoError::UnknownMessageType(0x09))
        ));
    }

    #[test]
    fn status_codes_keep_their_wire_values() {
        // The numeric values are fixed by the protocol; a bare CBOR
        // uint must decode to the matching status.
        for (value, status) in [
            (0u8, ResponseStatus::Ok),
            (1, ResponseStatus::InvalidContent),
            (2, ResponseStatus::InvalidNamespace),
            (3, ResponseStatus::InvalidTtl),
            (4, ResponseStatus::InvalidRecord),
            (5, ResponseStatus::InternalError),
            (6, ResponseStatus::InvalidLimit),
        ] {
            let buf = minicbor::to_vec(status).unwrap();
            assert_eq!(buf, minicbor::to_vec(value).unwrap());
            let decoded: ResponseStatus = minicbor::decode(&buf).unwrap();
            assert_eq!(decoded, status);
        }
    }
}
