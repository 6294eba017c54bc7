// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The error taxonomy shared by every boundary of the RPC core: topic resolution, payload
//! serialization, command invocation/execution, and telemetry send/receive.
//!
//! The taxonomy is a fixed set of *kinds*, not a type hierarchy: callers match on
//! [`ErrorKind`] rather than downcasting, which keeps the taxonomy stable even as individual
//! call sites evolve.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// The kind of error that occurred, independent of where in the stack it was raised.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Bad pattern, bad token, bad `CloudEvent` attribute, unsupported option. Shallow, local,
    /// never remote: detected at construction time, before any network IO.
    ConfigurationInvalid,
    /// A caller-supplied value failed validation at call time.
    ArgumentInvalid,
    /// A required MQTT user property or header was absent on a received message.
    HeaderMissing,
    /// An MQTT user property or header was present but malformed.
    HeaderInvalid,
    /// The serializer rejected the bytes, or the payload type did not match what was expected.
    PayloadInvalid,
    /// A deadline elapsed before a response, or before a handler could complete.
    Timeout,
    /// The caller cancelled the operation, or shutdown drained it.
    Cancelled,
    /// The underlying MQTT client surfaced a transport-level failure.
    MqttError,
    /// The peer is running an incompatible protocol major version.
    UnsupportedVersion,
    /// The remote command handler raised an application-level error.
    ExecutionException,
    /// The current program state does not admit the requested operation.
    StateInvalid,
    /// A runtime invariant was violated; this indicates a bug, not a misuse.
    InternalLogicError,
    /// A status code was received that does not map to any known kind.
    UnknownError,
}

/// The type of a value attached to a [`RpcError`] for diagnostic purposes.
#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    /// A signed integer value.
    Integer(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    String(String),
    /// A boolean value.
    Boolean(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// A boundary error raised by the RPC core.
#[derive(Debug)]
pub struct RpcError {
    /// Human readable message. Defaults to a message derived from `kind` if not set explicitly.
    pub message: Option<String>,
    /// The kind of error that occurred.
    pub kind: ErrorKind,
    /// `true` if this error originated in user-supplied handler code rather than the core.
    pub is_application_error: bool,
    /// `true` if this error was raised by a remote peer rather than locally.
    pub is_remote: bool,
    /// The nested error that caused this one, if any.
    pub nested_error: Option<Box<dyn StdError + Send + Sync>>,
    /// Name of the header/property that was missing or invalid.
    pub header_name: Option<String>,
    /// Value of the header/property that was invalid.
    pub header_value: Option<String>,
    /// Name of a struct field, function argument, or configuration value that is invalid.
    pub property_name: Option<String>,
    /// Value of a struct field, function argument, or configuration value that is invalid.
    pub property_value: Option<Value>,
    /// Name of the command relevant to this error, if any.
    pub command_name: Option<String>,
    /// The timeout duration, if this is a [`ErrorKind::Timeout`].
    pub timeout: Option<Duration>,
    /// Protocol major versions the local side supports, if this is an
    /// [`ErrorKind::UnsupportedVersion`] surfaced remotely.
    pub supported_major_versions: Option<Vec<u16>>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            return write!(f, "{message}");
        }
        match self.kind {
            ErrorKind::HeaderMissing => write!(
                f,
                "required header '{}' is missing",
                self.header_name.as_deref().unwrap_or("<unspecified>")
            ),
            ErrorKind::HeaderInvalid => write!(
                f,
                "header '{}' has an invalid value: '{}'",
                self.header_name.as_deref().unwrap_or("<unspecified>"),
                self.header_value.as_deref().unwrap_or("<unspecified>")
            ),
            ErrorKind::PayloadInvalid => write!(f, "payload serialization or deserialization failed"),
            ErrorKind::Timeout => write!(
                f,
                "operation timed out after {}",
                self.timeout.map_or_else(
                    || "<unspecified>".to_string(),
                    |d| format!("{}ms", d.as_millis())
                )
            ),
            ErrorKind::Cancelled => write!(f, "operation was cancelled"),
            ErrorKind::ConfigurationInvalid => write!(
                f,
                "configuration property '{}' is invalid: {}",
                self.property_name.as_deref().unwrap_or("<unspecified>"),
                self.property_value
                    .as_ref()
                    .map_or_else(|| "<unspecified>".to_string(), std::string::ToString::to_string)
            ),
            ErrorKind::ArgumentInvalid => write!(
                f,
                "argument '{}' is invalid: {}",
                self.property_name.as_deref().unwrap_or("<unspecified>"),
                self.property_value
                    .as_ref()
                    .map_or_else(|| "<unspecified>".to_string(), std::string::ToString::to_string)
            ),
            ErrorKind::StateInvalid => write!(
                f,
                "invalid state in '{}'",
                self.property_name.as_deref().unwrap_or("<unspecified>")
            ),
            ErrorKind::InternalLogicError => write!(
                f,
                "internal logic error in '{}'",
                self.property_name.as_deref().unwrap_or("<unspecified>")
            ),
            ErrorKind::UnknownError => write!(f, "an unmapped status code was received"),
            ErrorKind::ExecutionException => write!(f, "remote command handler raised an error"),
            ErrorKind::UnsupportedVersion => write!(
                f,
                "peer protocol version is unsupported (supported majors: {:?})",
                self.supported_major_versions.as_deref().unwrap_or(&[])
            ),
            ErrorKind::MqttError => write!(f, "MQTT transport error"),
        }
    }
}

impl StdError for RpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.nested_error
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl RpcError {
    fn bare(kind: ErrorKind) -> Self {
        Self {
            message: None,
            kind,
            is_application_error: false,
            is_remote: false,
            nested_error: None,
            header_name: None,
            header_value: None,
            property_name: None,
            property_value: None,
            command_name: None,
            timeout: None,
            supported_major_versions: None,
        }
    }

    fn finish(mut self) -> Self {
        if self.message.is_none() {
            self.message = Some(self.to_string());
        }
        self
    }

    /// Builds a [`ErrorKind::ConfigurationInvalid`] error for a bad construction-time value.
    #[must_use]
    pub fn configuration_invalid(property_name: &str, property_value: Value, message: Option<String>) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            message,
            ..Self::bare(ErrorKind::ConfigurationInvalid)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::ArgumentInvalid`] error for a bad call-time value.
    #[must_use]
    pub fn argument_invalid(property_name: &str, property_value: Value, message: Option<String>) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            message,
            ..Self::bare(ErrorKind::ArgumentInvalid)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::HeaderMissing`] error.
    #[must_use]
    pub fn header_missing(header_name: &str, message: Option<String>) -> Self {
        Self {
            header_name: Some(header_name.to_string()),
            message,
            ..Self::bare(ErrorKind::HeaderMissing)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::HeaderInvalid`] error.
    #[must_use]
    pub fn header_invalid(header_name: &str, header_value: &str, message: Option<String>) -> Self {
        Self {
            header_name: Some(header_name.to_string()),
            header_value: Some(header_value.to_string()),
            message,
            ..Self::bare(ErrorKind::HeaderInvalid)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::PayloadInvalid`] error, optionally wrapping a serializer error.
    #[must_use]
    pub fn payload_invalid(
        nested_error: Option<Box<dyn StdError + Send + Sync>>,
        message: Option<String>,
    ) -> Self {
        Self {
            nested_error,
            message,
            ..Self::bare(ErrorKind::PayloadInvalid)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::Timeout`] error.
    #[must_use]
    pub fn timeout(timeout: Duration, message: Option<String>) -> Self {
        Self {
            timeout: Some(timeout),
            message,
            ..Self::bare(ErrorKind::Timeout)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::Cancelled`] error.
    #[must_use]
    pub fn cancelled(message: Option<String>) -> Self {
        Self {
            message,
            ..Self::bare(ErrorKind::Cancelled)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::MqttError`] error wrapping the transport failure.
    #[must_use]
    pub fn mqtt_error(nested_error: Box<dyn StdError + Send + Sync>, message: Option<String>) -> Self {
        Self {
            nested_error: Some(nested_error),
            message,
            ..Self::bare(ErrorKind::MqttError)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::UnsupportedVersion`] error, `is_remote` when surfaced by a peer.
    #[must_use]
    pub fn unsupported_version(supported_major_versions: Vec<u16>, is_remote: bool, message: Option<String>) -> Self {
        Self {
            supported_major_versions: Some(supported_major_versions),
            is_remote,
            message,
            ..Self::bare(ErrorKind::UnsupportedVersion)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::ExecutionException`] error surfaced by a remote handler.
    #[must_use]
    pub fn execution_exception(property_name: Option<&str>, property_value: Option<Value>, message: Option<String>) -> Self {
        Self {
            property_name: property_name.map(str::to_string),
            property_value,
            is_application_error: true,
            is_remote: true,
            message,
            ..Self::bare(ErrorKind::ExecutionException)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::StateInvalid`] error.
    #[must_use]
    pub fn state_invalid(property_name: &str, message: Option<String>) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            message,
            ..Self::bare(ErrorKind::StateInvalid)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::InternalLogicError`] error. Indicates a runtime invariant violation.
    #[must_use]
    pub fn internal_logic_error(property_name: &str, message: Option<String>) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            message,
            ..Self::bare(ErrorKind::InternalLogicError)
        }
        .finish()
    }

    /// Builds a [`ErrorKind::UnknownError`] error for an unmapped status code.
    #[must_use]
    pub fn unknown_error(is_remote: bool, message: Option<String>) -> Self {
        Self {
            is_remote,
            message,
            ..Self::bare(ErrorKind::UnknownError)
        }
        .finish()
    }
}

/// Numeric status codes carried on the wire in the `__stat` user property.
///
/// See `§7` of the protocol design for the propagation policy that maps these to [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200: the command completed successfully.
    Ok,
    /// 204: the command completed successfully with no response payload.
    NoContent,
    /// 400: the request header or payload was malformed.
    BadRequest,
    /// 408: the executor did not produce a response before the request expired.
    RequestTimeout,
    /// 415: the request's content type is not supported.
    UnsupportedMediaType,
    /// 422: the request targeted an invalid state, or the executor hit an internal logic error.
    UnprocessableContent,
    /// 500: the handler raised an application-level error.
    ExecutionException,
    /// 503: the peer's protocol major version is unsupported.
    UnsupportedVersion,
    /// 504: a downstream dependency timed out.
    GatewayTimeout,
    /// Any status code this SDK does not otherwise recognize.
    Unknown(u16),
}

impl StatusCode {
    /// The numeric value carried on the wire.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::RequestTimeout => 408,
            StatusCode::UnsupportedMediaType => 415,
            StatusCode::UnprocessableContent => 422,
            StatusCode::ExecutionException => 500,
            StatusCode::UnsupportedVersion => 503,
            StatusCode::GatewayTimeout => 504,
            StatusCode::Unknown(v) => v,
        }
    }

    /// Parses a status code from its wire value.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        match value {
            200 => StatusCode::Ok,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            408 => StatusCode::RequestTimeout,
            415 => StatusCode::UnsupportedMediaType,
            422 => StatusCode::UnprocessableContent,
            500 => StatusCode::ExecutionException,
            503 => StatusCode::UnsupportedVersion,
            504 => StatusCode::GatewayTimeout,
            other => StatusCode::Unknown(other),
        }
    }

    /// `true` for status codes that represent success (2xx).
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::NoContent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_round_trips() {
        for code in [200u16, 204, 400, 408, 415, 422, 500, 503, 504, 599] {
            assert_eq!(StatusCode::from_u16(code).as_u16(), code);
        }
    }

    #[test]
    fn unknown_status_code_preserves_value() {
        assert_eq!(StatusCode::from_u16(599), StatusCode::Unknown(599));
        assert!(!StatusCode::from_u16(599).is_success());
    }

    #[test]
    fn error_message_defaults_from_kind() {
        let err = RpcError::timeout(Duration::from_secs(2), None);
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn error_message_respects_override() {
        let err = RpcError::timeout(Duration::from_secs(2), Some("custom".to_string()));
        assert_eq!(err.to_string(), "custom");
    }
}
