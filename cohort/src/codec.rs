//! Pluggable serialization of protocol messages.
//!
//! Containers encode every [`Envelope`](crate::protocol::Envelope) and join
//! message through a [`MessageCodec`]. [`JsonCodec`] is the default: readable
//! on the wire and easy to debug. [`ContainerBuilder::codec`] and
//! [`GroupServerBuilder::codec`] swap it; both ends of a group must agree.
//!
//! [`ContainerBuilder::codec`]: crate::ContainerBuilder::codec
//! [`GroupServerBuilder::codec`]: crate::GroupServerBuilder::codec
//!
//! # Example
//!
//! ```rust
//! use cohort::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Chat {
//!     text: String,
//! }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Chat { text: "hi".into() }).unwrap();
//! assert_eq!(&bytes, br#"{"text":"hi"}"#);
//! let back: Chat = codec.decode(&bytes).unwrap();
//! assert_eq!(back.text, "hi");
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Pluggable message serialization format.
///
/// `Clone + Send + Sync + 'static` so a codec can be shared by a container,
/// its connection listeners and the server's peer tasks.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Move {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_json_codec_encode() {
        let bytes = JsonCodec.encode(&Move { x: 1, y: -2 }).unwrap();
        assert_eq!(&bytes, br#"{"x":1,"y":-2}"#);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let result: Result<Move, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_json_codec_missing_field() {
        let result: Result<Move, _> = JsonCodec.decode(br#"{"x":1}"#);
        assert!(matches!(result, Err(CodecError::Decode(ref msg)) if msg.contains("y")));
    }
}
