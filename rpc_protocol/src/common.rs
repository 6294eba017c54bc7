// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Utilities shared by the RPC and Telemetry modules: CloudEvents envelopes, the hybrid
//! logical clock, topic-pattern resolution, payload serialization, ordered acknowledgement,
//! and the reserved user-property names every message carries.

/// CloudEvents v1.0 envelope construction and parsing.
pub mod cloud_event;

/// Implementation of the hybrid logical clock.
pub mod hybrid_logical_clock;

/// FIFO acknowledgement release shared by the Command Executor and Telemetry Receiver.
pub mod ordered_ack;

/// Trait that payload structs implement to be serializable onto and off of the wire.
pub mod payload_serialize;

/// Topic pattern resolution, filter derivation, and token parsing.
pub mod topic_processor;

/// Reserved `__`-prefixed MQTT user property names.
pub mod user_properties;

/// Returns `true` if `s` contains a control character forbidden by the
/// [MQTT 5 UTF-8 Encoded String rules](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_UTF-8_Encoded_String).
#[must_use]
pub fn is_invalid_utf8(s: &str) -> bool {
    s.chars().any(|c| ('\u{0000}'..='\u{001F}').contains(&c) || ('\u{007F}'..='\u{009F}').contains(&c))
}
