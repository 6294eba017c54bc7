// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Re-exports of the wire-level MQTT v5 control packet types used at the boundary of this
//! crate. Kept as a shim so that callers never need to take a direct dependency on
//! [`rumqttc`]'s own module layout.

pub use rumqttc::v5::mqttbytes::v5::{Publish, PublishProperties, SubscribeProperties, UnsubscribeProperties};
pub use rumqttc::v5::mqttbytes::QoS;

/// An MQTT topic name: fully resolved, no `+`/`#` wildcards.
pub type TopicName = String;
/// An MQTT topic filter: may contain `+`/`#` wildcards.
pub type TopicFilter = String;
