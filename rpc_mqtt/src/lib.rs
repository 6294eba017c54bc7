// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! MQTT version 5 client contracts consumed by the edge RPC protocol core.
//!
//! This crate does not implement the MQTT wire protocol, reconnection policy, or session
//! persistence itself; those are [`rumqttc`]'s job. What lives here is the boundary the
//! protocol core actually depends on: a small set of traits ([`interface::MqttPubSub`],
//! [`interface::AckHandle`], [`interface::ManagedClient`], [`interface::PubReceiver`]) plus a
//! thin adapter over `rumqttc` that satisfies them.

pub mod control_packet;
pub mod error;
pub mod interface;

#[doc(hidden)]
pub mod test_support;

mod managed_client;

pub use managed_client::{RumqttcManagedClient, RumqttcPubReceiver};
