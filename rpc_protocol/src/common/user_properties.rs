// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reserved MQTT user property names used at the wire boundary (`§3`, `§6`), and
//! validation shared by every Invoker, Executor, Sender, and Receiver for caller-supplied
//! application metadata.

use std::fmt;
use std::str::FromStr;

use crate::common::topic_processor::contains_invalid_char;

/// Prefix reserved for protocol-owned user properties. Caller-supplied metadata MUST NOT use it.
pub const RESERVED_PREFIX: &str = "__";

/// Reserved MQTT user property names recognized at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserProperty {
    /// `__ts`: sender timestamp (hybrid logical clock).
    Timestamp,
    /// `__srcId`: invoker client id / sender id.
    SourceId,
    /// `__partition`: optional partition key.
    Partition,
    /// `__protVer`: wire protocol version, major.minor.
    ProtocolVersion,
    /// `__stat`: numeric response status code.
    Status,
    /// `__stMsg`: human-readable status message.
    StatusMessage,
    /// `__appErr`: `true` if the error was raised by application code rather than the protocol.
    IsApplicationError,
    /// `__propName`: name of the header/property a `BadRequest` response refers to.
    InvalidPropertyName,
    /// `__propValue`: value of the header/property a `BadRequest` response refers to.
    InvalidPropertyValue,
    /// `__supProtMajorVer`: protocol major versions the executor supports.
    SupportedMajorVersions,
}

impl fmt::Display for UserProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserProperty::Timestamp => "__ts",
            UserProperty::SourceId => "__srcId",
            UserProperty::Partition => "__partition",
            UserProperty::ProtocolVersion => "__protVer",
            UserProperty::Status => "__stat",
            UserProperty::StatusMessage => "__stMsg",
            UserProperty::IsApplicationError => "__appErr",
            UserProperty::InvalidPropertyName => "__propName",
            UserProperty::InvalidPropertyValue => "__propValue",
            UserProperty::SupportedMajorVersions => "__supProtMajorVer",
        };
        write!(f, "{s}")
    }
}

impl FromStr for UserProperty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "__ts" => Ok(UserProperty::Timestamp),
            "__srcId" => Ok(UserProperty::SourceId),
            "__partition" => Ok(UserProperty::Partition),
            "__protVer" => Ok(UserProperty::ProtocolVersion),
            "__stat" => Ok(UserProperty::Status),
            "__stMsg" => Ok(UserProperty::StatusMessage),
            "__appErr" => Ok(UserProperty::IsApplicationError),
            "__propName" => Ok(UserProperty::InvalidPropertyName),
            "__propValue" => Ok(UserProperty::InvalidPropertyValue),
            "__supProtMajorVer" => Ok(UserProperty::SupportedMajorVersions),
            _ => Err(()),
        }
    }
}

/// Validates a set of caller-supplied (key, value) user properties.
///
/// # Errors
/// Returns a description of the failure if any key starts with [`RESERVED_PREFIX`], or if any
/// key or value contains characters outside the printable-ASCII topic-label grammar.
pub fn validate_user_properties(properties: &[(String, String)]) -> Result<(), String> {
    for (key, value) in properties {
        if key.starts_with(RESERVED_PREFIX) {
            return Err(format!(
                "custom user property key '{key}' uses the reserved prefix '{RESERVED_PREFIX}'"
            ));
        }
        if contains_invalid_char(key) {
            return Err(format!("custom user property key '{key}' contains invalid characters"));
        }
        if contains_invalid_char(value) {
            return Err(format!(
                "custom user property value '{value}' for key '{key}' contains invalid characters"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_round_trip() {
        for p in [
            UserProperty::Timestamp,
            UserProperty::SourceId,
            UserProperty::Partition,
            UserProperty::ProtocolVersion,
            UserProperty::Status,
            UserProperty::StatusMessage,
            UserProperty::IsApplicationError,
            UserProperty::InvalidPropertyName,
            UserProperty::InvalidPropertyValue,
            UserProperty::SupportedMajorVersions,
        ] {
            assert_eq!(UserProperty::from_str(&p.to_string()), Ok(p));
        }
    }

    #[test]
    fn rejects_reserved_prefix() {
        let props = vec![("__custom".to_string(), "v".to_string())];
        assert!(validate_user_properties(&props).is_err());
    }

    #[test]
    fn accepts_application_metadata() {
        let props = vec![("ex:region".to_string(), "west".to_string())];
        assert!(validate_user_properties(&props).is_ok());
    }
}
