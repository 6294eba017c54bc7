// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Telemetry sender and receiver: fire-and-forget pub/sub sharing the same envelope and
//! ordered-ack machinery as the command Invoker/Executor.
use crate::ProtocolVersion;

/// Telemetry sender implementation.
pub mod sender;

/// Telemetry receiver implementation.
pub mod receiver;

pub use receiver::Receiver;
pub use sender::Sender;

/// Protocol version stamped on every telemetry message by this crate's Sender.
pub(crate) const TELEMETRY_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
/// Assumed telemetry protocol version when a message carries none.
pub(crate) const DEFAULT_TELEMETRY_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
