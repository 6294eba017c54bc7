// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for defining sets and subsets of MQTT client functionality.
//!
//! The RPC core depends on exactly this surface, nothing more: publish/subscribe/unsubscribe
//! with completion tokens, manual acknowledgement of a received publish, and a per-filter
//! receiver that can be created any number of times against one shared, externally-managed
//! connection. Reconnection, session persistence, and TLS/SAT auth live entirely on the other
//! side of this boundary.

use async_trait::async_trait;
use bytes::Bytes;

use crate::control_packet::{Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties};
use crate::error::{AckError, ClientError, CompletionError};

/// Awaitable token indicating completion (broker acknowledgement) of an MQTT operation.
///
/// Wraps whatever the underlying client hands back from `publish`/`subscribe`/`unsubscribe`
/// without forcing callers to depend on `rumqttc` types directly. Fake transports (see
/// [`crate::test_support`]) mint the [`CompletionToken::Ready`] variant directly, since they
/// have no real broker round-trip to wait on.
pub enum CompletionToken {
    /// Backed by a real in-flight `rumqttc` notice.
    Pending(rumqttc::NoticeFuture),
    /// Already resolved; `wait` returns this value immediately.
    Ready(Result<(), CompletionError>),
}

impl CompletionToken {
    /// Waits for the broker to acknowledge the operation this token was issued for.
    ///
    /// # Errors
    /// Returns [`CompletionError`] if the broker rejected the operation, or if the connection
    /// was lost before the acknowledgement arrived.
    pub async fn wait(self) -> Result<(), CompletionError> {
        match self {
            Self::Pending(notice) => notice.wait_async().await.map_err(|_| CompletionError::Disconnected),
            Self::Ready(result) => result,
        }
    }
}

/// MQTT publish, subscribe, and unsubscribe functionality.
///
/// If the connection is temporarily unavailable, operations queue and are delivered once it is
/// re-established; callers do not need to retry on transient disconnects themselves.
#[async_trait]
pub trait MqttPubSub: Send + Sync {
    /// Publishes `payload` to `topic` at `qos`, without any MQTT 5 properties attached.
    ///
    /// # Errors
    /// Returns [`ClientError`] if the client has been permanently shut down.
    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Bytes) -> Result<CompletionToken, ClientError>;

    /// Publishes `payload` to `topic` at `qos`, attaching `properties` (correlation data,
    /// response topic, message expiry, user properties, content type, format indicator).
    ///
    /// # Errors
    /// Returns [`ClientError`] if the client has been permanently shut down.
    async fn publish_with_properties(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: PublishProperties,
    ) -> Result<CompletionToken, ClientError>;

    /// Subscribes to `topic` (a filter, possibly containing `+`/`#` wildcards) at `qos`.
    ///
    /// # Errors
    /// Returns [`ClientError`] if the client has been permanently shut down.
    async fn subscribe_with_properties(
        &self,
        topic: String,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, ClientError>;

    /// Removes a subscription previously established with
    /// [`subscribe_with_properties`](Self::subscribe_with_properties).
    ///
    /// # Errors
    /// Returns [`ClientError`] if the client has been permanently shut down.
    async fn unsubscribe_with_properties(
        &self,
        topic: String,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, ClientError>;
}

/// A handle for acknowledging exactly one received QoS-1 publish.
///
/// Holding this without calling [`ack`](Self::ack) is how the RPC core defers the broker-level
/// PUBACK until a handler has produced a response (or decided none is sendable); the underlying
/// client is not told the message was processed until this handle is consumed. Implemented once
/// per [`PubReceiver`] (real or, in tests, fake), so the core never depends on `rumqttc` types
/// directly.
#[async_trait]
pub trait AckHandle: Send {
    /// Acknowledges the publish this token was issued for.
    ///
    /// # Errors
    /// Returns [`AckError::AlreadyAcked`] if this token was already consumed, or
    /// [`AckError::Disconnected`] if the client could not be reached.
    async fn ack(self) -> Result<(), AckError>;
}

/// The [`AckHandle`] minted by [`crate::managed_client::RumqttcManagedClient`].
pub struct RumqttcAckToken {
    pub(crate) ack: Option<rumqttc::v5::ManualAck>,
    pub(crate) client: rumqttc::v5::AsyncClient,
}

#[async_trait]
impl AckHandle for RumqttcAckToken {
    async fn ack(mut self) -> Result<(), AckError> {
        let ack = self.ack.take().ok_or(AckError::AlreadyAcked)?;
        self.client.manual_ack(ack).await.map_err(|_| AckError::Disconnected)
    }
}

/// Receiver for incoming MQTT messages matching one registered topic filter.
#[async_trait]
pub trait PubReceiver: Send {
    /// The [`AckHandle`] this receiver pairs with each delivered publish.
    type AckToken: AckHandle;

    /// Receives the next incoming publish matching this receiver's filter, paired with an
    /// ack handle (absent only for QoS 0 deliveries, which this protocol never uses on
    /// request/response/telemetry streams).
    ///
    /// Returns `None` once the receiver has been closed and no further publishes will arrive.
    async fn recv(&mut self) -> Option<(Publish, Option<Self::AckToken>)>;
}

/// An MQTT client whose connection lifecycle (connect, reconnect, session resumption) is
/// managed externally; this crate only uses it to publish and to mint new per-filter receivers.
pub trait ManagedClient: MqttPubSub {
    /// The concrete [`PubReceiver`] type this client mints.
    type PubReceiver: PubReceiver;

    /// The MQTT client id this connection authenticated with.
    fn client_id(&self) -> &str;

    /// Registers a new receiver for publishes whose topic matches `topic_filter`.
    ///
    /// Multiple receivers may be created against overlapping filters; each receives its own copy
    /// of every matching publish, along with an independent ack handle it alone owns.
    ///
    /// # Errors
    /// Returns [`ClientError`] if `topic_filter` is not a well-formed MQTT topic filter.
    fn create_filtered_pub_receiver(&self, topic_filter: &str) -> Result<Self::PubReceiver, ClientError>;
}
