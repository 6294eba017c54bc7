// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! RPC-over-MQTT-5 protocol core: command invocation and execution, telemetry, and the
//! topic-pattern, envelope, and serialization conventions the two share.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

use std::fmt;
use std::str::FromStr;

pub mod application;
pub mod common;
pub mod error;
pub mod rpc;
pub mod telemetry;

#[macro_use]
extern crate derive_builder;

/// The `major.minor` protocol version carried on every request, response, and telemetry
/// message via the `__protVer` user property.
///
/// Only the major version gates compatibility: a receiver that supports major version `N`
/// accepts any message whose major version is `N`, regardless of minor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version. Messages with an unsupported major version are rejected.
    pub major: u16,
    /// Minor version. Never gates acceptance; carried for diagnostic purposes only.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parses a `"major.minor"` string as sent on the wire, returning `None` if it is not of
    /// that form or either component is not a valid `u16`.
    #[must_use]
    pub fn parse_protocol_version(value: &str) -> Option<Self> {
        let (major, minor) = value.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Returns `true` if this version's major component appears in `supported_major_versions`.
    #[must_use]
    pub fn is_supported(&self, supported_major_versions: &[u16]) -> bool {
        supported_major_versions.contains(&self.major)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_protocol_version(s).ok_or(())
    }
}

/// Formats a list of supported major protocol versions for inclusion in an error message, e.g.
/// `supported_protocol_major_versions_to_string(&[1, 2])` produces `"1, 2"`.
#[must_use]
pub fn supported_protocol_major_versions_to_string(supported_major_versions: &[u16]) -> String {
    supported_major_versions.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_version() {
        let version = ProtocolVersion::parse_protocol_version("1.0").unwrap();
        assert_eq!(version, ProtocolVersion { major: 1, minor: 0 });
    }

    #[test]
    fn rejects_malformed_version() {
        assert!(ProtocolVersion::parse_protocol_version("1").is_none());
        assert!(ProtocolVersion::parse_protocol_version("a.b").is_none());
    }

    #[test]
    fn is_supported_checks_major_only() {
        let version = ProtocolVersion { major: 1, minor: 7 };
        assert!(version.is_supported(&[1]));
        assert!(!version.is_supported(&[2]));
    }

    #[test]
    fn displays_as_major_dot_minor() {
        assert_eq!(ProtocolVersion { major: 1, minor: 0 }.to_string(), "1.0");
    }

    #[test]
    fn formats_supported_versions_list() {
        assert_eq!(supported_protocol_major_versions_to_string(&[1, 2]), "1, 2");
    }
}
