// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Command Invoker (`§4.4`): publishes a request on a resolved topic, tracks it by
//! correlation id in a pending-call table, and races the matching response against a deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use edge_rpc_mqtt::control_packet::{Publish, PublishProperties, QoS};
use edge_rpc_mqtt::interface::{AckHandle, ManagedClient, MqttPubSub, PubReceiver};

use crate::application::ApplicationContext;
use crate::common::hybrid_logical_clock::HybridLogicalClock;
use crate::common::payload_serialize::{FormatIndicator, PayloadSerialize};
use crate::common::topic_processor::TopicPattern;
use crate::common::user_properties::{validate_user_properties, UserProperty};
use crate::error::{ErrorKind, RpcError, StatusCode, Value};
use crate::rpc::RPC_COMMAND_PROTOCOL_VERSION;
use crate::ProtocolVersion;

/// Default deadline for a call when [`InvokeRequest::timeout`] is not overridden per call.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Command Invoker configuration.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct InvokerOptions {
    /// Topic pattern the request is published to, resolved per call against the invoke-time
    /// token map.
    pub request_topic_pattern: String,
    /// Command name, carried for diagnostics.
    pub command_name: String,
    /// Topic this invoker's instance listens for responses on. Must be exclusive to this
    /// invoker (e.g. scoped by the MQTT client id), since every in-flight call's response is
    /// demultiplexed by correlation id alone once it lands here.
    pub response_topic: String,
    /// Topic namespace prepended to the request topic.
    #[builder(default = "None")]
    pub topic_namespace: Option<String>,
    /// Topic token keys/values resolved once at construction time.
    #[builder(default)]
    pub topic_token_map: HashMap<String, String>,
}

/// A command invocation to send.
pub struct InvokeRequest<TReq> {
    /// Request payload.
    pub payload: TReq,
    /// Per-call topic tokens, merged over the pattern's construction-time token map.
    pub topic_tokens: HashMap<String, String>,
    /// Application metadata to attach as MQTT user properties on the request.
    pub custom_user_data: Vec<(String, String)>,
    /// How long to wait for a response before giving up. Also sent as the request's
    /// `MessageExpiry`, so the executor can bound its own handler execution to the same budget.
    pub timeout: Duration,
}

impl<TReq> InvokeRequest<TReq> {
    /// A request with no topic tokens, no custom metadata, and the default timeout.
    #[must_use]
    pub fn new(payload: TReq) -> Self {
        Self {
            payload,
            topic_tokens: HashMap::new(),
            custom_user_data: Vec::new(),
            timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

/// A successfully completed command invocation.
pub struct InvokeResponse<TResp> {
    /// Deserialized response payload.
    pub payload: TResp,
    /// Content type the response was received with.
    pub content_type: Option<String>,
    /// Application metadata the executor attached to the response.
    pub custom_user_data: Vec<(String, String)>,
    /// Executor-side timestamp, if the response carried a well-formed `__ts`.
    pub timestamp: Option<HybridLogicalClock>,
}

struct RawResponse {
    payload: Option<Bytes>,
    content_type: Option<String>,
    status: StatusCode,
    status_message: Option<String>,
    is_application_error: bool,
    custom_user_data: Vec<(String, String)>,
    timestamp: Option<HybridLogicalClock>,
    supported_major_versions: Option<Vec<u16>>,
}

fn response_to_error(raw: &RawResponse) -> RpcError {
    let message = raw.status_message.clone();
    let mut err = match raw.status {
        StatusCode::Ok | StatusCode::NoContent => {
            unreachable!("success statuses are handled before this is called")
        }
        StatusCode::BadRequest => RpcError::argument_invalid("request", Value::String(String::new()), message),
        StatusCode::RequestTimeout | StatusCode::GatewayTimeout => RpcError::timeout(Duration::default(), message),
        StatusCode::UnsupportedMediaType => RpcError::payload_invalid(None, message),
        StatusCode::UnprocessableContent => RpcError::state_invalid("response", message),
        StatusCode::ExecutionException => RpcError::execution_exception(None, None, message),
        StatusCode::UnsupportedVersion => {
            RpcError::unsupported_version(raw.supported_major_versions.clone().unwrap_or_default(), true, message)
        }
        StatusCode::Unknown(_) => RpcError::unknown_error(true, message),
    };
    err.is_remote = true;
    err.is_application_error = raw.is_application_error;
    err
}

/// Publishes command requests and awaits their responses, demultiplexed by correlation id.
pub struct Invoker {
    client: Arc<dyn MqttPubSub>,
    application_context: ApplicationContext,
    command_name: String,
    request_topic_pattern: TopicPattern,
    response_topic: String,
    invoker_client_id: String,
    pending: Arc<Mutex<HashMap<[u8; 16], oneshot::Sender<RawResponse>>>>,
    cancellation_token: CancellationToken,
    receive_task: Option<tokio::task::JoinHandle<()>>,
}

impl Invoker {
    /// Creates a new invoker and begins listening for responses immediately.
    ///
    /// # Errors
    /// Returns a configuration error if the request topic pattern/namespace/token map is
    /// malformed, or if `options.response_topic` is not a well-formed topic filter for `client`.
    pub fn new<C>(application_context: ApplicationContext, client: C, options: InvokerOptions) -> Result<Self, RpcError>
    where
        C: ManagedClient + Send + Sync + 'static,
        C::PubReceiver: Send + 'static,
    {
        let request_topic_pattern = TopicPattern::new(
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &options.topic_token_map,
        )?;

        let invoker_client_id = client.client_id().to_string();
        let mut receiver = client.create_filtered_pub_receiver(&options.response_topic).map_err(|e| {
            RpcError::configuration_invalid("response_topic", Value::String(options.response_topic.clone()), Some(e.to_string()))
        })?;

        let pending: Arc<Mutex<HashMap<[u8; 16], oneshot::Sender<RawResponse>>>> = Arc::new(Mutex::new(HashMap::new()));
        let cancellation_token = CancellationToken::new();

        let pending_loop = Arc::clone(&pending);
        let cancellation_loop = cancellation_token.clone();
        let receive_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation_loop.cancelled() => break,
                    next = receiver.recv() => {
                        let Some((publish, ack)) = next else { break };
                        Self::handle_response(&pending_loop, publish).await;
                        if let Some(token) = ack {
                            if let Err(e) = token.ack().await {
                                log::warn!("failed to ack command response: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            client: Arc::new(client),
            application_context,
            command_name: options.command_name,
            request_topic_pattern,
            response_topic: options.response_topic,
            invoker_client_id,
            pending,
            cancellation_token,
            receive_task: Some(receive_task),
        })
    }

    async fn handle_response(pending: &Arc<Mutex<HashMap<[u8; 16], oneshot::Sender<RawResponse>>>>, publish: Publish) {
        let Some(properties) = publish.properties.as_ref() else { return };
        let Some(correlation_id) = properties.correlation_data.as_ref().and_then(|c| <[u8; 16]>::try_from(c.as_ref()).ok()) else {
            return;
        };

        let Some(tx) = pending.lock().await.remove(&correlation_id) else {
            // No pending call for this correlation id: either it already timed out and was
            // removed, or this is a stray/duplicate delivery. Acked and dropped by the caller.
            return;
        };

        let mut status = StatusCode::Ok;
        let mut status_message = None;
        let mut is_application_error = false;
        let mut custom_user_data = Vec::new();
        let mut timestamp = None;
        let mut supported_major_versions = None;
        for (key, value) in &properties.user_properties {
            match key.as_str() {
                "__stat" => status = value.parse().map_or(StatusCode::Unknown(0), StatusCode::from_u16),
                "__stMsg" => status_message = Some(value.clone()),
                "__appErr" => is_application_error = value == "true",
                "__ts" => timestamp = value.parse().ok(),
                "__supProtMajorVer" => {
                    supported_major_versions = Some(value.split(", ").filter_map(|v| v.parse().ok()).collect());
                }
                _ if key.starts_with("__") => {}
                _ => custom_user_data.push((key.clone(), value.clone())),
            }
        }

        let raw = RawResponse {
            payload: if publish.payload.is_empty() { None } else { Some(publish.payload.clone()) },
            content_type: properties.content_type.clone(),
            status,
            status_message,
            is_application_error,
            custom_user_data,
            timestamp,
            supported_major_versions,
        };

        let _ = tx.send(raw);
    }

    /// Sends `request` and awaits the executor's response, or [`ErrorKind::Timeout`] if none
    /// arrives within `request.timeout`.
    ///
    /// # Errors
    /// Returns [`ErrorKind::ArgumentInvalid`] if `request.custom_user_data` uses the reserved
    /// `__` prefix, [`ErrorKind::MqttError`] if the request could not be published,
    /// [`ErrorKind::Timeout`] if no response arrives in time, or the error reported by the
    /// executor (translated from its `__stat` status code) otherwise.
    pub async fn invoke<TReq, TResp>(&self, request: InvokeRequest<TReq>) -> Result<InvokeResponse<TResp>, RpcError>
    where
        TReq: PayloadSerialize,
        TResp: PayloadSerialize,
    {
        if let Err(message) = validate_user_properties(&request.custom_user_data) {
            return Err(RpcError {
                message: Some(message),
                ..RpcError::argument_invalid("custom_user_data", Value::String(String::new()), None)
            });
        }

        let topic = self.request_topic_pattern.resolve(&request.topic_tokens)?;
        let correlation_id = *Uuid::new_v4().as_bytes();

        let payload_bytes = request
            .payload
            .serialize()
            .map_err(|e| RpcError::payload_invalid(Some(Box::new(e)), None))?;

        let timestamp = self.application_context.application_hlc.update_now()?;

        let mut user_properties = vec![
            (UserProperty::ProtocolVersion.to_string(), RPC_COMMAND_PROTOCOL_VERSION.to_string()),
            (UserProperty::SourceId.to_string(), self.invoker_client_id.clone()),
            (UserProperty::Timestamp.to_string(), timestamp),
        ];
        user_properties.extend(request.custom_user_data);

        let properties = PublishProperties {
            payload_format_indicator: Some(TReq::format_indicator() as u8),
            message_expiry_interval: Some(
                u32::try_from((request.timeout.as_millis() as u64).div_ceil(1000).max(1)).unwrap_or(u32::MAX),
            ),
            topic_alias: None,
            response_topic: Some(self.response_topic.clone()),
            correlation_data: Some(Bytes::copy_from_slice(&correlation_id)),
            user_properties,
            subscription_identifiers: Vec::new(),
            content_type: Some(TReq::content_type().to_string()).filter(|s| !s.is_empty()),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, tx);

        let publish_result = self
            .client
            .publish_with_properties(topic, QoS::AtLeastOnce, false, payload_bytes.map(Bytes::from).unwrap_or_default(), properties)
            .await;

        let token = match publish_result {
            Ok(token) => token,
            Err(e) => {
                self.pending.lock().await.remove(&correlation_id);
                return Err(RpcError::mqtt_error(Box::new(e), None));
            }
        };
        if let Err(e) = token.wait().await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(RpcError::mqtt_error(Box::new(e), None));
        }

        let raw = tokio::select! {
            result = rx => {
                match result {
                    Ok(raw) => raw,
                    Err(_) => return Err(RpcError::cancelled(Some("invoker was shut down before a response arrived".to_string()))),
                }
            }
            () = tokio::time::sleep(request.timeout) => {
                self.pending.lock().await.remove(&correlation_id);
                return Err(RpcError::timeout(request.timeout, Some(format!("command '{}' did not respond in time", self.command_name))));
            }
        };

        if let Some(hlc) = &raw.timestamp {
            let _ = self.application_context.application_hlc.update(hlc);
        }

        if !raw.status.is_success() {
            return Err(response_to_error(&raw));
        }

        let payload_slice = raw.payload.as_deref();
        let payload = TResp::deserialize(payload_slice).map_err(|e| RpcError::payload_invalid(Some(Box::new(e)), None))?;

        Ok(InvokeResponse {
            payload,
            content_type: raw.content_type,
            custom_user_data: raw.custom_user_data,
            timestamp: raw.timestamp,
        })
    }

    /// Stops listening for responses; calls already awaiting a response complete with
    /// [`ErrorKind::Cancelled`].
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.receive_task.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl MqttPubSub for Invoker {
    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Bytes) -> Result<edge_rpc_mqtt::interface::CompletionToken, edge_rpc_mqtt::error::ClientError> {
        self.client.publish(topic, qos, retain, payload).await
    }

    async fn publish_with_properties(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: PublishProperties,
    ) -> Result<edge_rpc_mqtt::interface::CompletionToken, edge_rpc_mqtt::error::ClientError> {
        self.client.publish_with_properties(topic, qos, retain, payload, properties).await
    }

    async fn subscribe_with_properties(
        &self,
        topic: String,
        qos: QoS,
        properties: edge_rpc_mqtt::control_packet::SubscribeProperties,
    ) -> Result<edge_rpc_mqtt::interface::CompletionToken, edge_rpc_mqtt::error::ClientError> {
        self.client.subscribe_with_properties(topic, qos, properties).await
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: String,
        properties: edge_rpc_mqtt::control_packet::UnsubscribeProperties,
    ) -> Result<edge_rpc_mqtt::interface::CompletionToken, edge_rpc_mqtt::error::ClientError> {
        self.client.unsubscribe_with_properties(topic, properties).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ApplicationContextOptionsBuilder;
    use crate::common::payload_serialize::Json;
    use edge_rpc_mqtt::control_packet::Publish as WirePublish;
    use edge_rpc_mqtt::test_support::{FakeBroker, FakeManagedClient};

    fn test_context() -> ApplicationContext {
        ApplicationContext::new(ApplicationContextOptionsBuilder::default().build().unwrap())
    }

    fn build_invoker(broker: &FakeBroker) -> Invoker {
        let client = FakeManagedClient::new("invoker-1", broker.clone());
        let options = InvokerOptionsBuilder::default()
            .request_topic_pattern("rpc/samples/hello")
            .command_name("hello")
            .response_topic("clients/invoker-1/response")
            .build()
            .unwrap();
        Invoker::new(test_context(), client, options).unwrap()
    }

    #[tokio::test]
    async fn invoke_times_out_when_no_response_arrives() {
        let broker = FakeBroker::new();
        let mut invoker = build_invoker(&broker);

        let mut request = InvokeRequest::new(Json("hi".to_string()));
        request.timeout = Duration::from_millis(30);
        let result: Result<InvokeResponse<Json<String>>, RpcError> = invoker.invoke(request).await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);

        invoker.shutdown().await;
    }

    #[tokio::test]
    async fn invoke_resolves_on_matching_response() {
        let broker = FakeBroker::new();
        let invoker = build_invoker(&broker);

        let request = InvokeRequest::new(Json("hi".to_string()));
        let invoke_fut = async { invoker.invoke::<_, Json<String>>(request).await };

        let deliver_fut = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let published = broker.published();
            assert_eq!(published.len(), 1);
            let correlation_data = published[0].properties.as_ref().unwrap().correlation_data.clone().unwrap();

            let mut response_properties = PublishProperties::default();
            response_properties.correlation_data = Some(correlation_data);
            response_properties.user_properties = vec![("__stat".to_string(), "200".to_string())];
            let response = WirePublish::new(
                "clients/invoker-1/response",
                QoS::AtLeastOnce,
                Bytes::from(Json("Hello hi".to_string()).serialize().unwrap().unwrap()),
                Some(response_properties),
            );
            broker.deliver(response);
        };

        let (result, ()) = tokio::join!(invoke_fut, deliver_fut);
        let response = result.unwrap();
        assert_eq!(response.payload.0, "Hello hi");
    }

    #[tokio::test]
    async fn sub_second_timeout_rounds_message_expiry_up() {
        let broker = FakeBroker::new();
        let mut invoker = build_invoker(&broker);

        let mut request = InvokeRequest::new(Json("hi".to_string()));
        request.timeout = Duration::from_millis(1500);
        let result: Result<InvokeResponse<Json<String>>, RpcError> = invoker.invoke(request).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);

        let published = broker.published();
        assert_eq!(published[0].properties.as_ref().unwrap().message_expiry_interval, Some(2));

        invoker.shutdown().await;
    }
}
