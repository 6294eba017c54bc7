// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Telemetry Sender (`§4.5`): resolves a topic, serializes a payload, optionally attaches a
//! CloudEvents envelope and arbitrary user properties, and publishes at the caller's QoS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use edge_rpc_mqtt::control_packet::{PublishProperties, QoS};
use edge_rpc_mqtt::interface::{ManagedClient, MqttPubSub};

use crate::application::ApplicationContext;
use crate::common::cloud_event::CloudEvent;
use crate::common::payload_serialize::PayloadSerialize;
use crate::common::topic_processor::TopicPattern;
use crate::common::user_properties::{validate_user_properties, UserProperty};
use crate::error::{RpcError, Value};
use crate::telemetry::TELEMETRY_PROTOCOL_VERSION;

/// Default message expiry attached to a telemetry publish.
pub const DEFAULT_TELEMETRY_MESSAGE_EXPIRY: Duration = Duration::from_secs(10);

/// Telemetry Sender configuration.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct SenderOptions {
    /// Topic pattern the telemetry event is published to.
    pub topic_pattern: String,
    /// Topic namespace prepended to the topic pattern.
    #[builder(default = "None")]
    pub topic_namespace: Option<String>,
    /// Topic token keys/values resolved once at construction time.
    #[builder(default)]
    pub topic_token_map: HashMap<String, String>,
}

/// A telemetry event to send.
pub struct TelemetryMessage<T> {
    /// Event payload.
    pub payload: T,
    /// Per-send topic tokens, merged over the pattern's construction-time token map.
    pub topic_tokens: HashMap<String, String>,
    /// Application metadata to attach as MQTT user properties. Must not use the reserved `__`
    /// prefix or collide with a [`crate::common::cloud_event::CloudEventFields`] header name.
    pub custom_user_data: Vec<(String, String)>,
    /// Quality of service to publish at. The protocol only uses `AtMostOnce` or `AtLeastOnce`.
    pub qos: QoS,
    /// How long the broker should retain this publish as unexpired.
    pub message_expiry: Duration,
    /// CloudEvents envelope to attach, if any.
    pub cloud_event: Option<CloudEvent>,
}

impl<T> TelemetryMessage<T> {
    /// A telemetry event with no topic tokens, no custom metadata, no CloudEvent, and the
    /// default QoS and message expiry.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            topic_tokens: HashMap::new(),
            custom_user_data: Vec::new(),
            qos: QoS::AtLeastOnce,
            message_expiry: DEFAULT_TELEMETRY_MESSAGE_EXPIRY,
            cloud_event: None,
        }
    }
}

/// Publishes telemetry events onto a resolved topic.
pub struct Sender {
    client: Arc<dyn MqttPubSub>,
    application_context: ApplicationContext,
    sender_client_id: String,
    topic_pattern: TopicPattern,
}

impl Sender {
    /// Creates a new sender.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::ConfigurationInvalid`] if the topic pattern, namespace,
    /// or token map is malformed.
    pub fn new<C>(application_context: ApplicationContext, client: C, options: SenderOptions) -> Result<Self, RpcError>
    where
        C: ManagedClient + Send + Sync + 'static,
    {
        let topic_pattern = TopicPattern::new(&options.topic_pattern, options.topic_namespace.as_deref(), &options.topic_token_map)?;
        let sender_client_id = client.client_id().to_string();

        Ok(Self {
            client: Arc::new(client),
            application_context,
            sender_client_id,
            topic_pattern,
        })
    }

    /// Sends `message`.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::ArgumentInvalid`] if `message.topic_tokens` does not
    /// resolve the topic pattern, or `message.custom_user_data` uses the reserved `__` prefix or
    /// a reserved CloudEvents field name. Returns [`crate::error::ErrorKind::PayloadInvalid`] if
    /// the payload fails to serialize. Returns [`crate::error::ErrorKind::MqttError`] if the
    /// publish fails or the broker's acknowledgement does not indicate success.
    pub async fn send<T: PayloadSerialize>(&self, mut message: TelemetryMessage<T>) -> Result<(), RpcError> {
        if let Err(reason) = validate_user_properties(&message.custom_user_data) {
            return Err(RpcError {
                message: Some(reason),
                ..RpcError::argument_invalid("custom_user_data", Value::String(String::new()), None)
            });
        }

        let topic = self.topic_pattern.resolve(&message.topic_tokens)?;

        let payload_bytes = message
            .payload
            .serialize()
            .map_err(|e| RpcError::payload_invalid(Some(Box::new(e)), None))?;

        let timestamp = self.application_context.application_hlc.update_now()?;

        if let Some(cloud_event) = message.cloud_event.take() {
            message.custom_user_data.extend(cloud_event.into_headers(&topic));
        }
        message.custom_user_data.push((UserProperty::Timestamp.to_string(), timestamp));
        message
            .custom_user_data
            .push((UserProperty::ProtocolVersion.to_string(), TELEMETRY_PROTOCOL_VERSION.to_string()));
        message
            .custom_user_data
            .push((UserProperty::SourceId.to_string(), self.sender_client_id.clone()));

        let properties = PublishProperties {
            payload_format_indicator: Some(T::format_indicator() as u8),
            message_expiry_interval: Some(
                u32::try_from((message.message_expiry.as_millis() as u64).div_ceil(1000).max(1)).unwrap_or(u32::MAX),
            ),
            topic_alias: None,
            response_topic: None,
            correlation_data: None,
            user_properties: message.custom_user_data,
            subscription_identifiers: Vec::new(),
            content_type: Some(T::content_type().to_string()).filter(|s| !s.is_empty()),
        };

        let token = self
            .client
            .publish_with_properties(topic, message.qos, false, payload_bytes.map(Bytes::from).unwrap_or_default(), properties)
            .await
            .map_err(|e| RpcError::mqtt_error(Box::new(e), None))?;

        token.wait().await.map_err(|e| RpcError::mqtt_error(Box::new(e), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ApplicationContextOptionsBuilder;
    use crate::common::cloud_event::CloudEventBuilder;
    use crate::common::payload_serialize::Json;
    use edge_rpc_mqtt::test_support::{FakeBroker, FakeManagedClient};

    fn test_context() -> ApplicationContext {
        ApplicationContext::new(ApplicationContextOptionsBuilder::default().build().unwrap())
    }

    fn build_sender(broker: &FakeBroker) -> Sender {
        let client = FakeManagedClient::new("sender-1", broker.clone());
        let options = SenderOptionsBuilder::default().topic_pattern("telemetry/samples/widget").build().unwrap();
        Sender::new(test_context(), client, options).unwrap()
    }

    #[tokio::test]
    async fn send_publishes_payload_with_protocol_headers() {
        let broker = FakeBroker::new();
        let sender = build_sender(&broker);

        sender.send(TelemetryMessage::new(Json("hello".to_string()))).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "telemetry/samples/widget");
        let properties = published[0].properties.as_ref().unwrap();
        let has_property = |name: &str| properties.user_properties.iter().any(|(k, _)| k == name);
        assert!(has_property("__ts"));
        assert!(has_property("__protVer"));
        assert!(has_property("__srcId"));
    }

    #[tokio::test]
    async fn send_attaches_cloud_event_headers() {
        let broker = FakeBroker::new();
        let sender = build_sender(&broker);

        let cloud_event = CloudEventBuilder::default().source("aio://edge/device-1").event_type("ex.telemetry").build().unwrap();
        let mut message = TelemetryMessage::new(Json("hello".to_string()));
        message.cloud_event = Some(cloud_event);
        sender.send(message).await.unwrap();

        let published = broker.published();
        let properties = published[0].properties.as_ref().unwrap();
        assert!(properties.user_properties.iter().any(|(k, v)| k == "source" && v == "aio://edge/device-1"));
    }

    #[tokio::test]
    async fn send_rejects_reserved_custom_user_data_key() {
        let broker = FakeBroker::new();
        let sender = build_sender(&broker);

        let mut message = TelemetryMessage::new(Json("hello".to_string()));
        message.custom_user_data.push(("__ts".to_string(), "bogus".to_string()));
        let err = sender.send(message).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ArgumentInvalid);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn send_rejects_unresolved_topic_token() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("sender-1", broker.clone());
        let options = SenderOptionsBuilder::default().topic_pattern("telemetry/{room}/widget").build().unwrap();
        let sender = Sender::new(test_context(), client, options).unwrap();

        let err = sender.send(TelemetryMessage::new(Json("hello".to_string()))).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ArgumentInvalid);
    }
}
