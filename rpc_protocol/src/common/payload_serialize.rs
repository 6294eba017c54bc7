// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The serializer boundary (`§4.2`) between application types and the bytes carried on the
//! wire as an MQTT payload, plus a handful of ready-made wrappers for common wire formats.
//!
//! Every payload type names its own content type and payload format indicator and serializes
//! itself; there is no single dynamic "wire format" enum. The one irregular case is the empty
//! payload: it MUST produce no bytes at all, not a zero-length byte vector, so [`serialize`]
//! returns `Option<Vec<u8>>` rather than `Vec<u8>` and [`deserialize`] accepts an absent slice.
//!
//! [`serialize`]: PayloadSerialize::serialize
//! [`deserialize`]: PayloadSerialize::deserialize

use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// The MQTT 5 payload format indicator, carried alongside `content_type` on every publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatIndicator {
    /// Payload is an unspecified sequence of bytes.
    UnspecifiedBytes = 0,
    /// Payload is UTF-8 encoded character data.
    Utf8EncodedCharacterData = 1,
}

/// A type that can be carried as an RPC or telemetry payload.
///
/// Implemented per concrete application type (request type, response type, telemetry event
/// type), rather than as a single payload format negotiated at runtime: the wire format is a
/// property of the Rust type, known at compile time.
pub trait PayloadSerialize: Sized {
    /// Error produced by [`serialize`](Self::serialize) or [`deserialize`](Self::deserialize).
    type Error: StdError + Send + Sync + 'static;

    /// The `content-type` this type serializes to, carried in the MQTT `PublishProperties`.
    fn content_type() -> &'static str;

    /// The payload format indicator this type serializes to.
    fn format_indicator() -> FormatIndicator;

    /// Serializes `self` to bytes.
    ///
    /// Returns `Ok(None)` for a type that carries no payload at all (see [`Empty`]); every
    /// other implementation returns `Ok(Some(bytes))`, never `Ok(Some(vec![]))` as a stand-in
    /// for "nothing".
    ///
    /// # Errors
    /// Returns `Self::Error` if the value cannot be encoded.
    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Deserializes `self` from bytes, or from the absence of a payload.
    ///
    /// `payload` is `None` when the incoming publish carried no payload bytes at all. Only
    /// [`Empty`] accepts that; every other implementation must reject it.
    ///
    /// # Errors
    /// Returns `Self::Error` if the bytes (or their absence) cannot be decoded as `Self`.
    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error>;
}

/// Error produced by a wrapper's codec.
#[derive(Debug)]
pub struct CodecError {
    format: &'static str,
    message: String,
}

impl CodecError {
    fn new(format: &'static str, message: impl Into<String>) -> Self {
        Self {
            format,
            message: message.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} payload error: {}", self.format, self.message)
    }
}

impl StdError for CodecError {}

/// A value with no payload. `serialize` produces no bytes; `deserialize` accepts none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl PayloadSerialize for Empty {
    type Error = CodecError;

    fn content_type() -> &'static str {
        ""
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(None)
    }

    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error> {
        match payload {
            None => Ok(Empty),
            Some(bytes) if bytes.is_empty() => Ok(Empty),
            Some(_) => Err(CodecError::new("empty", "expected no payload bytes")),
        }
    }
}

/// Raw, uninterpreted bytes. The only wrapper that performs no translation at all: `bytes` in,
/// `bytes` out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Raw(pub Vec<u8>);

impl PayloadSerialize for Raw {
    type Error = CodecError;

    fn content_type() -> &'static str {
        "application/octet-stream"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(Some(self.0.clone()))
    }

    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error> {
        let bytes = payload.ok_or_else(|| CodecError::new("raw", "expected payload bytes, got none"))?;
        if bytes.is_empty() {
            return Err(CodecError::new("raw", "expected non-empty payload bytes"));
        }
        Ok(Raw(bytes.to_vec()))
    }
}

/// A value serialized as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize + DeserializeOwned> PayloadSerialize for Json<T> {
    type Error = CodecError;

    fn content_type() -> &'static str {
        "application/json"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::Utf8EncodedCharacterData
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let bytes = serde_json::to_vec(&self.0).map_err(|e| CodecError::new("json", e.to_string()))?;
        Ok(Some(bytes))
    }

    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error> {
        let bytes = payload.ok_or_else(|| CodecError::new("json", "expected payload bytes, got none"))?;
        let value = serde_json::from_slice(bytes).map_err(|e| CodecError::new("json", e.to_string()))?;
        Ok(Json(value))
    }
}

/// A value serialized as CBOR.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cbor<T>(pub T);

impl<T: Serialize + DeserializeOwned> PayloadSerialize for Cbor<T> {
    type Error = CodecError;

    fn content_type() -> &'static str {
        "application/cbor"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&self.0, &mut bytes).map_err(|e| CodecError::new("cbor", e.to_string()))?;
        Ok(Some(bytes))
    }

    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error> {
        let bytes = payload.ok_or_else(|| CodecError::new("cbor", "expected payload bytes, got none"))?;
        let value = ciborium::from_reader(bytes).map_err(|e| CodecError::new("cbor", e.to_string()))?;
        Ok(Cbor(value))
    }
}

/// A value serialized as a protocol buffers message.
#[derive(Debug, Clone, Default)]
pub struct Protobuf<T>(pub T);

impl<T: prost::Message + Default> PayloadSerialize for Protobuf<T> {
    type Error = CodecError;

    fn content_type() -> &'static str {
        "application/x-protobuf"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(Some(self.0.encode_to_vec()))
    }

    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error> {
        let bytes = payload.ok_or_else(|| CodecError::new("protobuf", "expected payload bytes, got none"))?;
        let value = T::decode(bytes).map_err(|e| CodecError::new("protobuf", e.to_string()))?;
        Ok(Protobuf(value))
    }
}

/// A value serialized as Avro, using a schema supplied by the implementing type.
///
/// Unlike the other wrappers, the Avro schema isn't implied by `T` alone, so callers provide it
/// through the [`AvroSchema`] trait rather than a generic bound on `serde`.
pub trait AvroSchema {
    /// The Avro schema this type encodes against.
    fn avro_schema() -> &'static apache_avro::Schema;
}

#[derive(Debug, Clone, Default)]
pub struct Avro<T>(pub T, PhantomData<T>);

impl<T> Avro<T> {
    pub fn new(value: T) -> Self {
        Self(value, PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned + AvroSchema> PayloadSerialize for Avro<T> {
    type Error = CodecError;

    fn content_type() -> &'static str {
        "application/avro"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let value = apache_avro::to_value(&self.0).map_err(|e| CodecError::new("avro", e.to_string()))?;
        let bytes = apache_avro::to_avro_datum(T::avro_schema(), value)
            .map_err(|e| CodecError::new("avro", e.to_string()))?;
        Ok(Some(bytes))
    }

    fn deserialize(payload: Option<&[u8]>) -> Result<Self, Self::Error> {
        let bytes = payload.ok_or_else(|| CodecError::new("avro", "expected payload bytes, got none"))?;
        let mut reader = bytes;
        let value = apache_avro::from_avro_datum(T::avro_schema(), &mut reader, None)
            .map_err(|e| CodecError::new("avro", e.to_string()))?;
        let decoded = apache_avro::from_value(&value).map_err(|e| CodecError::new("avro", e.to_string()))?;
        Ok(Avro::new(decoded))
    }
}

#[cfg(test)]
mockall::mock! {
    pub Payload {}
    impl PayloadSerialize for Payload {
        type Error = CodecError;
        fn content_type() -> &'static str;
        fn format_indicator() -> FormatIndicator;
        fn serialize(&self) -> Result<Option<Vec<u8>>, CodecError>;
        fn deserialize(payload: Option<&[u8]>) -> Result<Self, CodecError>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn empty_serializes_to_no_bytes() {
        assert_eq!(Empty.serialize().unwrap(), None);
        assert_eq!(Empty::deserialize(None).unwrap(), Empty);
        assert_eq!(Empty::deserialize(Some(&[])).unwrap(), Empty);
    }

    #[test]
    fn empty_rejects_nonempty_bytes() {
        assert!(Empty::deserialize(Some(&[1])).is_err());
    }

    #[test]
    fn raw_round_trips_bytes_unchanged() {
        let raw = Raw(vec![1, 2, 3]);
        let bytes = raw.serialize().unwrap().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(Raw::deserialize(Some(&bytes)).unwrap(), raw);
    }

    #[test]
    fn raw_rejects_absent_payload() {
        assert!(Raw::deserialize(None).is_err());
    }

    #[test]
    fn raw_rejects_empty_payload() {
        assert!(Raw::deserialize(Some(&[])).is_err());
    }

    #[test]
    fn json_round_trips() {
        let widget = Json(Widget {
            name: "bolt".to_string(),
            count: 4,
        });
        let bytes = widget.serialize().unwrap().unwrap();
        let decoded = Json::<Widget>::deserialize(Some(&bytes)).unwrap();
        assert_eq!(decoded.0, widget.0);
        assert_eq!(Json::<Widget>::content_type(), "application/json");
    }

    #[test]
    fn cbor_round_trips() {
        let widget = Cbor(Widget {
            name: "nut".to_string(),
            count: 9,
        });
        let bytes = widget.serialize().unwrap().unwrap();
        let decoded = Cbor::<Widget>::deserialize(Some(&bytes)).unwrap();
        assert_eq!(decoded.0, widget.0);
    }
}
