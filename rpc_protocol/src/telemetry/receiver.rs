// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Telemetry Receiver (`§4.6`): subscribes to a topic pattern, parses each incoming publish
//! into a [`Message`], and hands it to the caller one at a time while preserving ordered PUBACK
//! on the underlying subscription (the same guarantee [`crate::rpc::executor`] gives command
//! requests), regardless of how quickly the caller processes each delivery relative to the next.

use std::collections::HashMap;
use std::marker::PhantomData;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use edge_rpc_mqtt::control_packet::Publish;
use edge_rpc_mqtt::interface::{AckHandle, ManagedClient, PubReceiver};

use crate::application::ApplicationContext;
use crate::common::cloud_event::CloudEvent;
use crate::common::hybrid_logical_clock::HybridLogicalClock;
use crate::common::ordered_ack::OrderedAckQueue;
use crate::common::payload_serialize::PayloadSerialize;
use crate::common::topic_processor::{contains_invalid_char, TopicPattern};
use crate::common::user_properties::UserProperty;
use crate::error::{RpcError, Value};
use crate::telemetry::{DEFAULT_TELEMETRY_PROTOCOL_VERSION, TELEMETRY_PROTOCOL_VERSION};
use crate::ProtocolVersion;

type AckTokenOf<C> = <<C as ManagedClient>::PubReceiver as PubReceiver>::AckToken;

/// Telemetry Receiver configuration.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct ReceiverOptions {
    /// Topic pattern the receiver subscribes to, with unresolved tokens filled by wildcards.
    pub topic_pattern: String,
    /// Topic namespace prepended to the topic pattern.
    #[builder(default = "None")]
    pub topic_namespace: Option<String>,
    /// Topic token keys/values resolved once at construction time.
    #[builder(default)]
    pub topic_token_map: HashMap<String, String>,
    /// Shared-subscription group to request the topic filter under.
    #[builder(default = "None")]
    pub service_group_id: Option<String>,
    /// When `true` (the default), each delivery is acked as soon as it is handed to the caller,
    /// without waiting for the caller to finish processing it. When `false`, the caller must
    /// call [`DeliveryToken::ack`] (or let the token drop, which discards it) before this
    /// receiver's broker-perceived ack order advances past that delivery.
    #[builder(default = "true")]
    pub auto_ack: bool,
}

/// A received telemetry event.
pub struct Message<T> {
    /// Deserialized event payload.
    pub payload: T,
    /// Content type the event was received with.
    pub content_type: Option<String>,
    /// Application metadata carried as MQTT user properties on the event, excluding any
    /// reserved protocol or `CloudEvent` headers.
    pub custom_user_data: Vec<(String, String)>,
    /// Client id of the sender, if present.
    pub sender_id: Option<String>,
    /// Sender timestamp, if the event carried a well-formed `__ts`.
    pub timestamp: Option<HybridLogicalClock>,
    /// Topic tokens resolved from the event's actual topic.
    pub topic_tokens: HashMap<String, String>,
    /// The topic this event was published to.
    pub topic: String,
    /// The `CloudEvent` envelope carried on this event, if any were recognized.
    pub cloud_event: Option<CloudEvent>,
}

/// A still-unresolved acknowledgement for one delivered [`Message`].
///
/// Present only when the receiver was constructed with `auto_ack: false`. Dropping this without
/// calling [`Self::ack`] discards it, same as calling [`Self::discard`] explicitly: the
/// underlying publish is never acked, but the receiver's ordered-ack queue is still free to
/// advance past it.
pub struct DeliveryToken {
    tx: Option<oneshot::Sender<bool>>,
}

impl DeliveryToken {
    fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Acknowledges the publish this delivery was issued for, once this receiver's ordered-ack
    /// queue reaches its turn.
    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Discards this delivery without acknowledging it.
    pub fn discard(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

impl Drop for DeliveryToken {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

fn parse_message<T: PayloadSerialize>(publish: &Publish, topic_pattern: &TopicPattern) -> Result<Message<T>, RpcError> {
    let topic = publish.topic.clone();

    let mut custom_user_data = Vec::new();
    let mut sender_id = None;
    let mut timestamp = None;
    let mut cloud_event_headers = Vec::new();

    if let Some(properties) = publish.properties.as_ref() {
        if let Some(protocol_version) = properties
            .user_properties
            .iter()
            .find(|(k, _)| *k == UserProperty::ProtocolVersion.to_string())
            .map(|(_, v)| v.as_str())
        {
            let version = ProtocolVersion::parse_protocol_version(protocol_version)
                .ok_or_else(|| RpcError::header_invalid("__protVer", protocol_version, None))?;
            if version.major != TELEMETRY_PROTOCOL_VERSION.major {
                return Err(RpcError::unsupported_version(vec![TELEMETRY_PROTOCOL_VERSION.major], false, None));
            }
        } else if DEFAULT_TELEMETRY_PROTOCOL_VERSION.major != TELEMETRY_PROTOCOL_VERSION.major {
            return Err(RpcError::unsupported_version(vec![TELEMETRY_PROTOCOL_VERSION.major], false, None));
        }

        for (key, value) in &properties.user_properties {
            match key.as_str() {
                "__ts" => timestamp = value.parse().ok(),
                "__srcId" => sender_id = Some(value.clone()),
                _ if key.starts_with("__") => {}
                "id" | "source" | "specversion" | "type" | "subject" | "time" | "datacontenttype" | "dataschema" => {
                    cloud_event_headers.push((key.clone(), value.clone()));
                }
                _ => custom_user_data.push((key.clone(), value.clone())),
            }
        }
    }

    let cloud_event = CloudEvent::from_user_properties(&cloud_event_headers).ok();

    let content_type = publish.properties.as_ref().and_then(|p| p.content_type.clone());
    let payload_bytes = if publish.payload.is_empty() { None } else { Some(publish.payload.as_ref()) };
    let payload = T::deserialize(payload_bytes).map_err(|e| RpcError::payload_invalid(Some(Box::new(e)), None))?;

    let topic_tokens = topic_pattern.parse_tokens(&topic);

    Ok(Message {
        payload,
        content_type,
        custom_user_data,
        sender_id,
        timestamp,
        topic_tokens,
        topic,
        cloud_event,
    })
}

/// Subscribes to telemetry events on a topic pattern and hands them to the caller one at a time.
pub struct Receiver<T> {
    recv_rx: mpsc::UnboundedReceiver<(Message<T>, Option<DeliveryToken>)>,
    cancellation_token: CancellationToken,
    recv_task: Option<tokio::task::JoinHandle<()>>,
    message_payload_type: PhantomData<T>,
}

impl<T: PayloadSerialize + Send + Sync + 'static> Receiver<T> {
    /// Creates a new receiver and subscribes immediately.
    ///
    /// # Errors
    /// Returns a configuration error if the topic pattern/namespace/token map is malformed, or
    /// if the derived subscription filter is rejected by `client`.
    pub fn new<C>(application_context: ApplicationContext, client: C, options: ReceiverOptions) -> Result<Self, RpcError>
    where
        C: ManagedClient + Send + Sync + 'static,
        C::PubReceiver: Send + 'static,
        AckTokenOf<C>: Send + 'static,
    {
        let topic_pattern = TopicPattern::new(&options.topic_pattern, options.topic_namespace.as_deref(), &options.topic_token_map)?;

        let mut filter = topic_pattern.as_filter();
        if let Some(group) = &options.service_group_id {
            if contains_invalid_char(group) {
                return Err(RpcError::configuration_invalid(
                    "service_group_id",
                    Value::String(group.clone()),
                    Some("service group id contains invalid characters".to_string()),
                ));
            }
            filter = format!("$share/{group}/{filter}");
        }

        let mut mqtt_receiver = client.create_filtered_pub_receiver(&filter).map_err(|e| {
            RpcError::configuration_invalid("topic_pattern", Value::String(filter.clone()), Some(e.to_string()))
        })?;

        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let auto_ack = options.auto_ack;

        let ack_queue: OrderedAckQueue<AckTokenOf<C>> = OrderedAckQueue::new(|token: AckTokenOf<C>| async move {
            if let Err(e) = token.ack().await {
                log::warn!("failed to ack telemetry event: {e}");
            }
        });

        let cancellation_loop = cancellation_token.clone();
        let recv_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation_loop.cancelled() => break,
                    next = mqtt_receiver.recv() => {
                        let Some((publish, ack)) = next else { break };
                        let slot = ack_queue.enqueue().await;

                        let message = match parse_message::<T>(&publish, &topic_pattern) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("discarding malformed telemetry event on '{}': {e}", publish.topic);
                                match ack {
                                    Some(token) => slot.ready(token).await,
                                    None => slot.discard().await,
                                }
                                continue;
                            }
                        };

                        if let Some(hlc) = &message.timestamp {
                            let _ = application_context.application_hlc.update(hlc);
                        }

                        if auto_ack {
                            match ack {
                                Some(token) => slot.ready(token).await,
                                None => slot.discard().await,
                            }
                            if recv_tx.send((message, None)).is_err() {
                                break;
                            }
                        } else {
                            let (delivery, done_rx) = DeliveryToken::new();
                            if recv_tx.send((message, Some(delivery))).is_err() {
                                slot.discard().await;
                                break;
                            }
                            tokio::spawn(async move {
                                let should_ack = done_rx.await.unwrap_or(false);
                                match (should_ack, ack) {
                                    (true, Some(token)) => slot.ready(token).await,
                                    _ => slot.discard().await,
                                }
                            });
                        }
                    }
                }
            }
        });

        Ok(Self {
            recv_rx,
            cancellation_token,
            recv_task: Some(recv_task),
            message_payload_type: PhantomData,
        })
    }

    /// Receives the next telemetry event, paired with a [`DeliveryToken`] when this receiver was
    /// constructed with `auto_ack: false`.
    ///
    /// Returns `None` once the receiver has been shut down and no further events will arrive.
    pub async fn recv(&mut self) -> Option<(Message<T>, Option<DeliveryToken>)> {
        self.recv_rx.recv().await
    }

    /// Stops accepting new events.
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.recv_task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use edge_rpc_mqtt::control_packet::{Publish, PublishProperties, QoS};
    use edge_rpc_mqtt::test_support::{FakeAckToken, FakeBroker, FakeManagedClient};

    use super::*;
    use crate::application::ApplicationContextOptionsBuilder;
    use crate::common::payload_serialize::Json;

    fn test_context() -> ApplicationContext {
        ApplicationContext::new(ApplicationContextOptionsBuilder::default().build().unwrap())
    }

    fn telemetry_publish(payload: &str) -> Publish {
        let properties = PublishProperties {
            payload_format_indicator: Some(1),
            message_expiry_interval: Some(10),
            topic_alias: None,
            response_topic: None,
            correlation_data: None,
            user_properties: vec![("__protVer".to_string(), "1.0".to_string()), ("__srcId".to_string(), "sender-1".to_string())],
            subscription_identifiers: Vec::new(),
            content_type: Some("application/json".to_string()),
        };
        Publish::new(
            "telemetry/samples/widget",
            QoS::AtLeastOnce,
            Bytes::from(Json(payload.to_string()).serialize().unwrap().unwrap()),
            Some(properties),
        )
    }

    #[tokio::test]
    async fn auto_ack_delivers_without_a_delivery_token() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("receiver-1", broker.clone());
        let options = ReceiverOptionsBuilder::default().topic_pattern("telemetry/samples/widget").build().unwrap();
        let mut receiver: Receiver<Json<String>> = Receiver::new(test_context(), client, options).unwrap();

        let flag = broker.deliver(telemetry_publish("hello")).unwrap();
        let (message, delivery) = receiver.recv().await.unwrap();
        assert_eq!(message.payload.0, "hello");
        assert_eq!(message.sender_id.as_deref(), Some("sender-1"));
        assert!(delivery.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(FakeAckToken::was_acked(&flag));

        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn manual_ack_defers_until_delivery_token_is_acked() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("receiver-1", broker.clone());
        let options = ReceiverOptionsBuilder::default()
            .topic_pattern("telemetry/samples/widget")
            .auto_ack(false)
            .build()
            .unwrap();
        let mut receiver: Receiver<Json<String>> = Receiver::new(test_context(), client, options).unwrap();

        let flag = broker.deliver(telemetry_publish("hello")).unwrap();
        let (message, delivery) = receiver.recv().await.unwrap();
        assert_eq!(message.payload.0, "hello");
        let delivery = delivery.expect("manual ack mode must hand back a delivery token");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!FakeAckToken::was_acked(&flag));

        delivery.ack();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(FakeAckToken::was_acked(&flag));

        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_delivery_token_discards_without_acking() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("receiver-1", broker.clone());
        let options = ReceiverOptionsBuilder::default()
            .topic_pattern("telemetry/samples/widget")
            .auto_ack(false)
            .build()
            .unwrap();
        let mut receiver: Receiver<Json<String>> = Receiver::new(test_context(), client, options).unwrap();

        let flag = broker.deliver(telemetry_publish("hello")).unwrap();
        let (_message, delivery) = receiver.recv().await.unwrap();
        drop(delivery);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!FakeAckToken::was_acked(&flag));

        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_discarded_and_not_delivered() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("receiver-1", broker.clone());
        let options = ReceiverOptionsBuilder::default().topic_pattern("telemetry/samples/widget").build().unwrap();
        let mut receiver: Receiver<Json<String>> = Receiver::new(test_context(), client, options).unwrap();

        let properties = PublishProperties {
            payload_format_indicator: Some(1),
            message_expiry_interval: Some(10),
            topic_alias: None,
            response_topic: None,
            correlation_data: None,
            user_properties: vec![("__protVer".to_string(), "1.0".to_string())],
            subscription_identifiers: Vec::new(),
            content_type: Some("application/json".to_string()),
        };
        let malformed = Publish::new("telemetry/samples/widget", QoS::AtLeastOnce, Bytes::from_static(b"not json"), Some(properties));
        broker.deliver(malformed);
        broker.deliver(telemetry_publish("hello"));

        let (message, _delivery) = receiver.recv().await.unwrap();
        assert_eq!(message.payload.0, "hello");

        receiver.shutdown().await;
    }
}
