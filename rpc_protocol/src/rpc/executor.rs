// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Command Executor (`§4.3`): accepts requests on a request-topic pattern, dispatches each
//! to a user-supplied [`CommandHandler`] under bounded concurrency, dedups and caches responses,
//! and publishes them on each request's response topic while preserving ordered PUBACK on the
//! request stream.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use edge_rpc_mqtt::control_packet::{Publish, PublishProperties, QoS};
use edge_rpc_mqtt::interface::{AckHandle, ManagedClient, MqttPubSub, PubReceiver};

use crate::application::ApplicationContext;
use crate::common::hybrid_logical_clock::HybridLogicalClock;
use crate::common::ordered_ack::{AckSlot, OrderedAckQueue};
use crate::common::payload_serialize::{FormatIndicator, PayloadSerialize};
use crate::common::topic_processor::{contains_invalid_char, TopicPattern};
use crate::common::user_properties::UserProperty;
use crate::error::{RpcError, StatusCode, Value};
use crate::rpc::{RPC_COMMAND_PROTOCOL_VERSION, SUPPORTED_RPC_COMMAND_PROTOCOL_VERSIONS};
use crate::{supported_protocol_major_versions_to_string, ProtocolVersion};

/// Default lifetime of a cached response for an idempotent command.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default number of command handler invocations the executor runs concurrently.
pub const DEFAULT_MAX_CONCURRENT_DISPATCH: usize = 1;
/// `MessageExpiry` assumed for a malformed request that could not be parsed far enough to
/// recover its own expiry interval, solely to bound how long its error response stays cached.
const FALLBACK_MESSAGE_EXPIRY: Duration = Duration::from_secs(10);

type AckTokenOf<C> = <<C as ManagedClient>::PubReceiver as PubReceiver>::AckToken;

/// A received command request, handed to a [`CommandHandler`].
pub struct CommandRequest<TReq> {
    /// Deserialized request payload.
    pub payload: TReq,
    /// Content type the request was received with.
    pub content_type: Option<String>,
    /// Application-supplied MQTT user properties carried on the request.
    pub custom_user_data: Vec<(String, String)>,
    /// Sender timestamp, if the request carried a well-formed `__ts`.
    pub timestamp: Option<HybridLogicalClock>,
    /// Client id of the invoker that sent this request, if present.
    pub invoker_id: Option<String>,
    /// Topic tokens resolved from the request's actual topic.
    pub topic_tokens: HashMap<String, String>,
}

/// A command handler's successful result.
pub struct CommandResponse<TResp> {
    /// Response payload.
    pub payload: TResp,
    /// Content type to report on the wire. Defaults to `TResp::content_type()` when `None`.
    pub content_type: Option<String>,
    /// Payload format indicator to report on the wire. Defaults to `TResp::format_indicator()`.
    pub format_indicator: Option<FormatIndicator>,
    /// Application metadata to attach as MQTT user properties on the response.
    pub custom_user_data: Vec<(String, String)>,
}

impl<TResp: PayloadSerialize> CommandResponse<TResp> {
    /// Wraps `payload` with no extra metadata, using the payload type's own wire defaults.
    #[must_use]
    pub fn new(payload: TResp) -> Self {
        Self {
            payload,
            content_type: None,
            format_indicator: None,
            custom_user_data: Vec::new(),
        }
    }
}

/// User-supplied command logic invoked by an [`Executor`] for each accepted, non-duplicate
/// request.
///
/// `cancellation` is signalled once the request's remaining `MessageExpiry` elapses; handlers
/// are not forcibly aborted when it fires (`§5`) — a handler that ignores it and completes late
/// still produces a response, though the invoker will typically have already given up on it.
#[async_trait]
pub trait CommandHandler<TReq, TResp>: Send + Sync
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
{
    /// Executes the command and produces its response.
    ///
    /// # Errors
    /// Any [`RpcError`] returned here is reported to the invoker as an execution exception with
    /// `is_application_error = true`.
    async fn handle(
        &self,
        request: CommandRequest<TReq>,
        cancellation: CancellationToken,
    ) -> Result<CommandResponse<TResp>, RpcError>;
}

/// Command Executor configuration.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct ExecutorOptions {
    /// Topic pattern for the command request.
    pub request_topic_pattern: String,
    /// Command name, used for idempotent-cache fingerprinting and diagnostics.
    pub command_name: String,
    /// Topic namespace prepended to the request and response topics.
    #[builder(default = "None")]
    pub topic_namespace: Option<String>,
    /// Topic token keys/values resolved once at construction time.
    #[builder(default)]
    pub topic_token_map: HashMap<String, String>,
    /// Shared-subscription group to request the request topic filter under.
    #[builder(default = "None")]
    pub service_group_id: Option<String>,
    /// Whether repeated invocation of the command handler has no observable side effect, so a
    /// differently-correlated but otherwise identical request may be served from cache (`§4.3`
    /// idempotency policy).
    #[builder(default = "false")]
    pub is_idempotent: bool,
    /// How long a cached response for an idempotent command remains servable, clamped to the
    /// originating request's own `MessageExpiry`.
    #[builder(default = "DEFAULT_CACHE_TTL")]
    pub cache_ttl: Duration,
    /// Upper bound on concurrently executing handler invocations.
    #[builder(default = "DEFAULT_MAX_CONCURRENT_DISPATCH")]
    pub max_concurrent_dispatch: usize,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Correlation([u8; 16]),
    Fingerprint(u64),
}

#[derive(Clone)]
struct CachedResponse {
    payload: Option<Bytes>,
    content_type: Option<String>,
    format_indicator: FormatIndicator,
    status: StatusCode,
    status_message: Option<String>,
    is_application_error: bool,
    custom_user_data: Vec<(String, String)>,
}

enum CacheEntry {
    InFlight(Vec<oneshot::Sender<CachedResponse>>),
    Ready {
        response: CachedResponse,
        expires_at: Instant,
    },
}

/// Outcome of probing the cache before dispatching a handler.
enum CacheProbe {
    /// No entry existed; this caller owns execution and must eventually call
    /// [`Cache::complete`].
    Owner,
    /// An in-flight execution owns this key; resolves once it finishes.
    Wait(oneshot::Receiver<CachedResponse>),
    /// A prior response is still cached and ready to republish as-is.
    Ready(CachedResponse),
}

struct Cache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl Cache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn probe(&self, key: CacheKey) -> CacheProbe {
        let mut entries = self.entries.lock().await;
        Self::sweep_expired(&mut entries);
        match entries.get_mut(&key) {
            Some(CacheEntry::InFlight(waiters)) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                CacheProbe::Wait(rx)
            }
            Some(CacheEntry::Ready { response, .. }) => CacheProbe::Ready(response.clone()),
            None => {
                entries.insert(key, CacheEntry::InFlight(Vec::new()));
                CacheProbe::Owner
            }
        }
    }

    async fn complete(&self, key: CacheKey, response: CachedResponse, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        let waiters = match entries.remove(&key) {
            Some(CacheEntry::InFlight(waiters)) => waiters,
            _ => Vec::new(),
        };
        for waiter in waiters {
            let _ = waiter.send(response.clone());
        }
        entries.insert(
            key,
            CacheEntry::Ready {
                response,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn sweep_expired(entries: &mut HashMap<CacheKey, CacheEntry>) {
        let now = Instant::now();
        entries.retain(|_, entry| !matches!(entry, CacheEntry::Ready { expires_at, .. } if *expires_at <= now));
    }
}

fn fingerprint(command_name: &str, payload: &[u8], custom_user_data: &[(String, String)]) -> u64 {
    let mut sorted = custom_user_data.to_vec();
    sorted.sort();
    let mut hasher = DefaultHasher::new();
    command_name.hash(&mut hasher);
    payload.hash(&mut hasher);
    sorted.hash(&mut hasher);
    hasher.finish()
}

/// Accepts command requests on a topic pattern and dispatches them to a [`CommandHandler`].
pub struct Executor {
    cancellation_token: CancellationToken,
    dispatch_task: Option<tokio::task::JoinHandle<()>>,
}

impl Executor {
    /// Creates a new executor and begins listening for requests immediately; `handler` is
    /// invoked for every accepted, non-duplicate request.
    ///
    /// # Errors
    /// Returns a configuration error if `options.command_name` is empty or contains invalid
    /// characters, or if the topic pattern/namespace/token map is malformed.
    pub fn new<C, TReq, TResp>(
        application_context: ApplicationContext,
        client: C,
        options: ExecutorOptions,
        handler: impl CommandHandler<TReq, TResp> + 'static,
    ) -> Result<Self, RpcError>
    where
        C: ManagedClient + Send + Sync + 'static,
        C::PubReceiver: Send + 'static,
        AckTokenOf<C>: Send + 'static,
        TReq: PayloadSerialize + Send + Sync + 'static,
        TResp: PayloadSerialize + Send + Sync + 'static,
    {
        if options.command_name.trim().is_empty() || contains_invalid_char(&options.command_name) {
            return Err(RpcError::configuration_invalid(
                "command_name",
                Value::String(options.command_name.clone()),
                Some("command name is empty or contains invalid characters".to_string()),
            ));
        }

        let request_topic_pattern = TopicPattern::new(
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &options.topic_token_map,
        )?;

        let mut filter = request_topic_pattern.as_filter();
        if let Some(group) = &options.service_group_id {
            filter = format!("$share/{group}/{filter}");
        }
        let mut receiver = client.create_filtered_pub_receiver(&filter).map_err(|e| {
            RpcError::configuration_invalid("request_topic_pattern", Value::String(filter.clone()), Some(e.to_string()))
        })?;

        let client = Arc::new(client);
        let cancellation_token = CancellationToken::new();
        let cache = Arc::new(Cache::new());
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent_dispatch.max(1)));
        let ack_queue: OrderedAckQueue<AckTokenOf<C>> = OrderedAckQueue::new(|token: AckTokenOf<C>| async move {
            if let Err(e) = token.ack().await {
                log::warn!("failed to ack command request: {e}");
            }
        });

        let dispatch = Arc::new(DispatchState {
            client,
            application_context,
            command_name: options.command_name,
            request_topic_pattern,
            is_idempotent: options.is_idempotent,
            cache_ttl: options.cache_ttl,
            cache,
            semaphore,
            handler: Box::new(handler),
        });

        let ack_queue_loop = ack_queue;
        let cancellation_loop = cancellation_token.clone();
        let dispatch_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation_loop.cancelled() => break,
                    next = receiver.recv() => {
                        let Some((publish, ack)) = next else { break };
                        let slot = ack_queue_loop.enqueue().await;
                        let dispatch = Arc::clone(&dispatch);
                        let handler_cancel = cancellation_loop.child_token();
                        tokio::spawn(async move {
                            dispatch.handle_publish(publish, ack, slot, handler_cancel).await;
                        });
                    }
                }
            }
        });

        Ok(Self {
            cancellation_token,
            dispatch_task: Some(dispatch_task),
        })
    }

    /// Stops accepting new requests. Already-dispatched handlers are not aborted; their
    /// cancellation tokens are signalled, but a handler that ignores that signal still runs to
    /// completion and its response is best-effort published.
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.dispatch_task.take() {
            let _ = task.await;
        }
    }
}

struct DispatchState<C, TReq, TResp>
where
    C: ManagedClient,
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
{
    client: Arc<C>,
    application_context: ApplicationContext,
    command_name: String,
    request_topic_pattern: TopicPattern,
    is_idempotent: bool,
    cache_ttl: Duration,
    cache: Arc<Cache>,
    semaphore: Arc<Semaphore>,
    handler: Box<dyn CommandHandler<TReq, TResp>>,
}

struct ValidatedRequest {
    correlation_id: [u8; 16],
    response_topic: String,
    message_expiry: Duration,
    custom_user_data: Vec<(String, String)>,
    timestamp: Option<HybridLogicalClock>,
    invoker_id: Option<String>,
}

impl<C, TReq, TResp> DispatchState<C, TReq, TResp>
where
    C: ManagedClient + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
    AckTokenOf<C>: Send + 'static,
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
{
    async fn handle_publish(
        self: Arc<Self>,
        publish: Publish,
        ack: Option<AckTokenOf<C>>,
        slot: AckSlot<AckTokenOf<C>>,
        handler_cancel: CancellationToken,
    ) {
        let validated = match self.validate(&publish) {
            Ok(v) => v,
            Err((status, err)) => {
                self.respond_to_invalid(&publish, status, &err).await;
                match ack {
                    Some(token) => slot.ready(token).await,
                    None => slot.discard().await,
                }
                return;
            }
        };

        if let Some(hlc) = &validated.timestamp {
            let _ = self.application_context.application_hlc.update(hlc);
        }

        let topic_tokens = self.request_topic_pattern.parse_tokens(&publish.topic);

        let cache_key = if self.is_idempotent {
            CacheKey::Fingerprint(fingerprint(&self.command_name, &publish.payload, &validated.custom_user_data))
        } else {
            CacheKey::Correlation(validated.correlation_id)
        };

        let response = match self.cache.probe(cache_key.clone()).await {
            CacheProbe::Ready(response) => Some(response),
            CacheProbe::Wait(rx) => rx.await.ok(),
            CacheProbe::Owner => {
                let response = self.execute(&publish, &validated, topic_tokens, handler_cancel).await;
                self.cache.complete(cache_key, response.clone(), self.effective_cache_ttl(&validated)).await;
                Some(response)
            }
        };

        if let Some(response) = response {
            self.publish_response(&validated, response).await;
        }

        match ack {
            Some(token) => slot.ready(token).await,
            None => slot.discard().await,
        }
    }

    fn effective_cache_ttl(&self, validated: &ValidatedRequest) -> Duration {
        if self.is_idempotent {
            self.cache_ttl.min(validated.message_expiry)
        } else {
            validated.message_expiry
        }
    }

    fn validate(&self, publish: &Publish) -> Result<ValidatedRequest, (StatusCode, RpcError)> {
        let properties = publish
            .properties
            .as_ref()
            .ok_or_else(|| (StatusCode::BadRequest, RpcError::header_missing("Message Expiry", None)))?;

        let message_expiry_secs = properties
            .message_expiry_interval
            .ok_or_else(|| (StatusCode::BadRequest, RpcError::header_missing("Message Expiry", None)))?;

        if let Some(protocol_version) = properties
            .user_properties
            .iter()
            .find(|(k, _)| *k == UserProperty::ProtocolVersion.to_string())
            .map(|(_, v)| v.as_str())
        {
            let version = ProtocolVersion::parse_protocol_version(protocol_version)
                .ok_or_else(|| (StatusCode::BadRequest, RpcError::header_invalid("__protVer", protocol_version, None)))?;
            if !version.is_supported(SUPPORTED_RPC_COMMAND_PROTOCOL_VERSIONS) {
                return Err((
                    StatusCode::UnsupportedVersion,
                    RpcError::unsupported_version(SUPPORTED_RPC_COMMAND_PROTOCOL_VERSIONS.to_vec(), false, None),
                ));
            }
        }

        let correlation_data = properties
            .correlation_data
            .as_ref()
            .ok_or_else(|| (StatusCode::BadRequest, RpcError::header_missing("Correlation Data", None)))?;
        let correlation_id: [u8; 16] = correlation_data.as_ref().try_into().map_err(|_| {
            (StatusCode::BadRequest, RpcError::header_invalid("Correlation Data", &hex_string(correlation_data), None))
        })?;

        let response_topic = properties
            .response_topic
            .clone()
            .ok_or_else(|| (StatusCode::BadRequest, RpcError::header_missing("Response Topic", None)))?;

        let mut custom_user_data = Vec::new();
        let mut timestamp = None;
        let mut invoker_id = None;
        for (key, value) in &properties.user_properties {
            match key.as_str() {
                "__ts" => timestamp = value.parse().ok(),
                "__srcId" => invoker_id = Some(value.clone()),
                _ if key.starts_with("__") => {}
                _ => custom_user_data.push((key.clone(), value.clone())),
            }
        }

        Ok(ValidatedRequest {
            correlation_id,
            response_topic,
            message_expiry: Duration::from_secs(u64::from(message_expiry_secs)),
            custom_user_data,
            timestamp,
            invoker_id,
        })
    }

    async fn execute(
        &self,
        publish: &Publish,
        validated: &ValidatedRequest,
        topic_tokens: HashMap<String, String>,
        handler_cancel: CancellationToken,
    ) -> CachedResponse {
        let expiry_timer_cancel = handler_cancel.clone();
        let expiry = validated.message_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            expiry_timer_cancel.cancel();
        });

        let payload_bytes = if publish.payload.is_empty() { None } else { Some(publish.payload.as_ref()) };
        let payload = match TReq::deserialize(payload_bytes) {
            Ok(p) => p,
            Err(e) => {
                return CachedResponse {
                    payload: None,
                    content_type: None,
                    format_indicator: FormatIndicator::UnspecifiedBytes,
                    status: StatusCode::BadRequest,
                    status_message: Some(e.to_string()),
                    is_application_error: false,
                    custom_user_data: Vec::new(),
                };
            }
        };

        let request = CommandRequest {
            payload,
            content_type: publish.properties.as_ref().and_then(|p| p.content_type.clone()),
            custom_user_data: validated.custom_user_data.clone(),
            timestamp: validated.timestamp.clone(),
            invoker_id: validated.invoker_id.clone(),
            topic_tokens,
        };

        let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");

        match self.handler.handle(request, handler_cancel).await {
            Ok(response) => match response.payload.serialize() {
                Ok(bytes) => {
                    let bytes = bytes.map(Bytes::from);
                    let status = if bytes.is_none() { StatusCode::NoContent } else { StatusCode::Ok };
                    CachedResponse {
                        payload: bytes,
                        content_type: response.content_type.or_else(|| Some(TResp::content_type().to_string())),
                        format_indicator: response.format_indicator.unwrap_or_else(TResp::format_indicator),
                        status,
                        status_message: None,
                        is_application_error: false,
                        custom_user_data: response.custom_user_data,
                    }
                }
                Err(e) => CachedResponse {
                    payload: None,
                    content_type: None,
                    format_indicator: FormatIndicator::UnspecifiedBytes,
                    status: StatusCode::UnprocessableContent,
                    status_message: Some(format!("response serialization failed: {e}")),
                    is_application_error: false,
                    custom_user_data: Vec::new(),
                },
            },
            Err(err) => CachedResponse {
                payload: None,
                content_type: None,
                format_indicator: FormatIndicator::UnspecifiedBytes,
                status: StatusCode::ExecutionException,
                status_message: err.message.clone(),
                is_application_error: true,
                custom_user_data: Vec::new(),
            },
        }
    }

    async fn respond_to_invalid(&self, publish: &Publish, status: StatusCode, err: &RpcError) {
        let Some(properties) = publish.properties.as_ref() else {
            return;
        };
        let Some(response_topic) = properties.response_topic.clone() else {
            return;
        };
        let Some(correlation_id) = properties.correlation_data.as_ref().and_then(|c| <[u8; 16]>::try_from(c.as_ref()).ok()) else {
            return;
        };

        let validated = ValidatedRequest {
            correlation_id,
            response_topic,
            message_expiry: properties
                .message_expiry_interval
                .map_or(FALLBACK_MESSAGE_EXPIRY, |s| Duration::from_secs(u64::from(s))),
            custom_user_data: Vec::new(),
            timestamp: None,
            invoker_id: None,
        };
        let response = CachedResponse {
            payload: None,
            content_type: None,
            format_indicator: FormatIndicator::UnspecifiedBytes,
            status,
            status_message: err.message.clone(),
            is_application_error: false,
            custom_user_data: error_header_properties(err),
        };
        self.publish_response(&validated, response).await;
    }

    async fn publish_response(&self, validated: &ValidatedRequest, response: CachedResponse) {
        let timestamp = self.application_context.application_hlc.update_now().unwrap_or_default();

        let mut user_properties = vec![
            (UserProperty::Status.to_string(), response.status.as_u16().to_string()),
            (UserProperty::ProtocolVersion.to_string(), RPC_COMMAND_PROTOCOL_VERSION.to_string()),
            (UserProperty::IsApplicationError.to_string(), response.is_application_error.to_string()),
            (UserProperty::Timestamp.to_string(), timestamp),
        ];
        if let Some(message) = &response.status_message {
            user_properties.push((UserProperty::StatusMessage.to_string(), message.clone()));
        }
        if response.status == StatusCode::UnsupportedVersion {
            user_properties.push((
                UserProperty::SupportedMajorVersions.to_string(),
                supported_protocol_major_versions_to_string(SUPPORTED_RPC_COMMAND_PROTOCOL_VERSIONS),
            ));
        }
        user_properties.extend(response.custom_user_data);

        let properties = PublishProperties {
            payload_format_indicator: Some(response.format_indicator as u8),
            message_expiry_interval: Some(u32::try_from(validated.message_expiry.as_secs()).unwrap_or(u32::MAX)),
            topic_alias: None,
            response_topic: None,
            correlation_data: Some(Bytes::copy_from_slice(&validated.correlation_id)),
            user_properties,
            subscription_identifiers: Vec::new(),
            content_type: response.content_type.filter(|s| !s.is_empty()),
        };

        let payload = response.payload.unwrap_or_default();
        match self
            .client
            .publish_with_properties(validated.response_topic.clone(), QoS::AtLeastOnce, false, payload, properties)
            .await
        {
            Ok(token) => {
                if let Err(e) = token.wait().await {
                    log::warn!("failed to publish command response to '{}': {e}", validated.response_topic);
                }
            }
            Err(e) => log::warn!("failed to publish command response to '{}': {e}", validated.response_topic),
        }
    }
}

fn error_header_properties(err: &RpcError) -> Vec<(String, String)> {
    let mut props = Vec::new();
    if let Some(name) = &err.header_name {
        props.push((UserProperty::InvalidPropertyName.to_string(), name.clone()));
    }
    if let Some(value) = &err.header_value {
        props.push((UserProperty::InvalidPropertyValue.to_string(), value.clone()));
    }
    props
}

fn hex_string(bytes: &Bytes) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ApplicationContextOptionsBuilder;
    use crate::common::payload_serialize::Json;
    use edge_rpc_mqtt::test_support::{FakeBroker, FakeManagedClient};
    use uuid::Uuid;

    struct Echo;

    #[async_trait]
    impl CommandHandler<Json<String>, Json<String>> for Echo {
        async fn handle(
            &self,
            request: CommandRequest<Json<String>>,
            _cancellation: CancellationToken,
        ) -> Result<CommandResponse<Json<String>>, RpcError> {
            Ok(CommandResponse::new(Json(format!("Hello {}", request.payload.0))))
        }
    }

    fn test_context() -> ApplicationContext {
        ApplicationContext::new(ApplicationContextOptionsBuilder::default().build().unwrap())
    }

    fn request_properties(correlation_id: [u8; 16], response_topic: &str) -> PublishProperties {
        PublishProperties {
            payload_format_indicator: Some(1),
            message_expiry_interval: Some(10),
            topic_alias: None,
            response_topic: Some(response_topic.to_string()),
            correlation_data: Some(Bytes::copy_from_slice(&correlation_id)),
            user_properties: vec![("__protVer".to_string(), "1.0".to_string())],
            subscription_identifiers: Vec::new(),
            content_type: Some("application/json".to_string()),
        }
    }

    #[tokio::test]
    async fn happy_path_publishes_ok_response() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("executor", broker.clone());
        let options = ExecutorOptionsBuilder::default()
            .request_topic_pattern("rpc/samples/hello")
            .command_name("hello")
            .build()
            .unwrap();
        let mut executor = Executor::new(test_context(), client, options, Echo).unwrap();

        let correlation_id = *Uuid::new_v4().as_bytes();
        let payload = Json("User".to_string()).serialize().unwrap().unwrap();
        let publish = Publish::new(
            "rpc/samples/hello",
            QoS::AtLeastOnce,
            Bytes::from(payload),
            Some(request_properties(correlation_id, "clients/invoker-1/response")),
        );
        broker.deliver(publish);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "clients/invoker-1/response");
        let body: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body, serde_json::json!("Hello User"));

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn missing_message_expiry_yields_bad_request() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("executor", broker.clone());
        let options = ExecutorOptionsBuilder::default()
            .request_topic_pattern("rpc/samples/hello")
            .command_name("hello")
            .build()
            .unwrap();
        let mut executor = Executor::new(test_context(), client, options, Echo).unwrap();

        let correlation_id = *Uuid::new_v4().as_bytes();
        let mut properties = request_properties(correlation_id, "clients/invoker-1/response");
        properties.message_expiry_interval = None;
        let payload = Json("User".to_string()).serialize().unwrap().unwrap();
        let publish = Publish::new("rpc/samples/hello", QoS::AtLeastOnce, Bytes::from(payload), Some(properties));
        broker.deliver(publish);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let published = broker.published();
        assert_eq!(published.len(), 1);
        let status = published[0]
            .properties
            .as_ref()
            .unwrap()
            .user_properties
            .iter()
            .find(|(k, _)| k == "__stat")
            .map(|(_, v)| v.clone());
        assert_eq!(status, Some("400".to_string()));

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn idempotent_command_serves_duplicate_from_cache_without_rerunning_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingEcho(Arc<AtomicUsize>);

        #[async_trait]
        impl CommandHandler<Json<String>, Json<String>> for CountingEcho {
            async fn handle(
                &self,
                request: CommandRequest<Json<String>>,
                _cancellation: CancellationToken,
            ) -> Result<CommandResponse<Json<String>>, RpcError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(CommandResponse::new(Json(request.payload.0)))
            }
        }

        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("executor", broker.clone());
        let options = ExecutorOptionsBuilder::default()
            .request_topic_pattern("rpc/samples/hello")
            .command_name("hello")
            .is_idempotent(true)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut executor = Executor::new(test_context(), client, options, CountingEcho(Arc::clone(&calls))).unwrap();

        let payload = Json("same".to_string()).serialize().unwrap().unwrap();
        for i in 0..2 {
            let correlation_id = *Uuid::new_v4().as_bytes();
            let publish = Publish::new(
                "rpc/samples/hello",
                QoS::AtLeastOnce,
                Bytes::from(payload.clone()),
                Some(request_properties(correlation_id, &format!("clients/invoker-{i}/response"))),
            );
            broker.deliver(publish);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.published().len(), 2);

        executor.shutdown().await;
    }

    #[test]
    fn fingerprint_is_stable_for_same_inputs() {
        let a = fingerprint("isPrime", b"7", &[]);
        let b = fingerprint("isPrime", b"7", &[]);
        assert_eq!(a, b);
        let c = fingerprint("isPrime", b"8", &[]);
        assert_ne!(a, c);
    }
}
