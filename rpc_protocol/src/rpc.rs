// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command invocation (client side) and command execution (server side) over MQTT 5.

use crate::ProtocolVersion;

/// Command executor implementation.
pub mod executor;

/// Command invoker implementation.
pub mod invoker;

pub use executor::Executor;
pub use invoker::Invoker;

/// Protocol version stamped on every request and response by this crate's Invoker/Executor.
pub(crate) const RPC_COMMAND_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
/// Assumed request protocol version when a request carries none.
pub(crate) const DEFAULT_RPC_COMMAND_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
/// Major protocol versions this crate's Executor and Invoker accept.
pub(crate) const SUPPORTED_RPC_COMMAND_PROTOCOL_VERSIONS: &[u16] = &[1];
