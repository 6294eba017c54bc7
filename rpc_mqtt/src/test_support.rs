// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory [`ManagedClient`] for exercising the protocol core without a broker.
//!
//! Unlike a mock built on `expect()` call sequences, this records publishes for later
//! inspection and lets a test inject incoming publishes on whatever filter a receiver
//! registered for, mirroring the shape of a real broker round-trip closely enough that the
//! core's executor/invoker/telemetry logic cannot tell the difference.
#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::control_packet::{Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties};
use crate::error::{AckError, ClientError, CompletionError};
use crate::interface::{AckHandle, CompletionToken, ManagedClient, MqttPubSub, PubReceiver};
use crate::managed_client::topic_matches_filter;

/// A publish recorded by [`FakeManagedClient`], along with the properties it carried.
#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
    pub properties: Option<PublishProperties>,
}

/// An [`AckHandle`] that records whether it was ever consumed, for test assertions.
pub struct FakeAckToken {
    acked: Arc<Mutex<bool>>,
}

impl FakeAckToken {
    #[must_use]
    fn new() -> (Self, Arc<Mutex<bool>>) {
        let acked = Arc::new(Mutex::new(false));
        (Self { acked: Arc::clone(&acked) }, acked)
    }

    /// Returns `true` if [`AckHandle::ack`] has been called on this token (or its sibling
    /// handle sharing the same publish).
    #[must_use]
    pub fn was_acked(flag: &Arc<Mutex<bool>>) -> bool {
        *flag.lock().expect("ack flag mutex poisoned")
    }
}

#[async_trait]
impl AckHandle for FakeAckToken {
    async fn ack(self) -> Result<(), AckError> {
        let mut acked = self.acked.lock().expect("ack flag mutex poisoned");
        if *acked {
            return Err(AckError::AlreadyAcked);
        }
        *acked = true;
        Ok(())
    }
}

type PublishTx = mpsc::UnboundedSender<(Publish, Option<FakeAckToken>)>;

#[derive(Default)]
struct Registrations {
    filtered: HashMap<String, Vec<PublishTx>>,
}

/// A fake MQTT connection shared by a [`FakeManagedClient`] and whatever test code wants to
/// inject incoming publishes or inspect outgoing ones.
#[derive(Clone, Default)]
pub struct FakeBroker {
    published: Arc<Mutex<Vec<RecordedPublish>>>,
    registrations: Arc<Mutex<Registrations>>,
}

impl FakeBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every publish recorded so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().expect("published mutex poisoned").clone()
    }

    /// Delivers `publish` to every receiver whose registered filter matches its topic, as if
    /// it had arrived from a real broker. Returns the ack flag for the single ack handle
    /// minted (the last matching receiver gets it, matching [`crate::managed_client`]'s
    /// fan-out convention), or `None` if no receiver matched.
    pub fn deliver(&self, publish: Publish) -> Option<Arc<Mutex<bool>>> {
        let registrations = self.registrations.lock().expect("registrations mutex poisoned");
        let matching: Vec<&PublishTx> = registrations
            .filtered
            .iter()
            .filter(|(filter, _)| topic_matches_filter(&publish.topic, filter))
            .flat_map(|(_, txs)| txs.iter())
            .collect();

        if matching.is_empty() {
            return None;
        }

        let last_index = matching.len() - 1;
        let mut last_flag = None;
        for (i, tx) in matching.into_iter().enumerate() {
            let ack = if i == last_index {
                let (token, flag) = FakeAckToken::new();
                last_flag = Some(flag);
                Some(token)
            } else {
                None
            };
            let _ = tx.send((publish.clone(), ack));
        }
        last_flag
    }
}

/// A [`ManagedClient`] backed by a [`FakeBroker`] instead of a real connection.
#[derive(Clone)]
pub struct FakeManagedClient {
    client_id: String,
    broker: FakeBroker,
}

impl FakeManagedClient {
    #[must_use]
    pub fn new(client_id: impl Into<String>, broker: FakeBroker) -> Self {
        Self { client_id: client_id.into(), broker }
    }
}

#[async_trait]
impl MqttPubSub for FakeManagedClient {
    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Bytes) -> Result<CompletionToken, ClientError> {
        self.broker.published.lock().expect("published mutex poisoned").push(RecordedPublish {
            topic,
            qos,
            retain,
            payload,
            properties: None,
        });
        Ok(CompletionToken::Ready(Ok(())))
    }

    async fn publish_with_properties(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: PublishProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.broker.published.lock().expect("published mutex poisoned").push(RecordedPublish {
            topic,
            qos,
            retain,
            payload,
            properties: Some(properties),
        });
        Ok(CompletionToken::Ready(Ok(())))
    }

    async fn subscribe_with_properties(
        &self,
        _topic: String,
        _qos: QoS,
        _properties: SubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        Ok(CompletionToken::Ready(Ok(())))
    }

    async fn unsubscribe_with_properties(
        &self,
        _topic: String,
        _properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        Ok(CompletionToken::Ready(Ok(())))
    }
}

impl ManagedClient for FakeManagedClient {
    type PubReceiver = FakePubReceiver;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn create_filtered_pub_receiver(&self, topic_filter: &str) -> Result<Self::PubReceiver, ClientError> {
        if topic_filter.is_empty() {
            return Err(ClientError::InvalidTopicFilter(topic_filter.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .registrations
            .lock()
            .expect("registrations mutex poisoned")
            .filtered
            .entry(topic_filter.to_string())
            .or_default()
            .push(tx);
        Ok(FakePubReceiver { rx })
    }
}

/// A [`PubReceiver`] fed by deliveries made through a [`FakeBroker`].
pub struct FakePubReceiver {
    rx: mpsc::UnboundedReceiver<(Publish, Option<FakeAckToken>)>,
}

#[async_trait]
impl PubReceiver for FakePubReceiver {
    type AckToken = FakeAckToken;

    async fn recv(&mut self) -> Option<(Publish, Option<FakeAckToken>)> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_packet::Publish;

    #[tokio::test]
    async fn publish_is_recorded() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("test-client", broker.clone());
        client
            .publish("svc/thermostat/cmd".to_string(), QoS::AtLeastOnce, false, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "svc/thermostat/cmd");
    }

    #[tokio::test]
    async fn delivered_publish_reaches_matching_receiver() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("test-client", broker.clone());
        let mut receiver = client.create_filtered_pub_receiver("svc/+/cmd").unwrap();

        let publish = Publish::new("svc/thermostat/cmd", QoS::AtLeastOnce, Bytes::from_static(b"hi"), None);
        let flag = broker.deliver(publish).expect("receiver should match");

        let (received, ack) = receiver.recv().await.expect("publish should be delivered");
        assert_eq!(received.topic, "svc/thermostat/cmd");
        let ack = ack.expect("ack token should be present");
        assert!(!FakeAckToken::was_acked(&flag));
        ack.ack().await.unwrap();
        assert!(FakeAckToken::was_acked(&flag));
    }

    #[tokio::test]
    async fn non_matching_filter_receives_nothing() {
        let broker = FakeBroker::new();
        let client = FakeManagedClient::new("test-client", broker.clone());
        let _receiver = client.create_filtered_pub_receiver("svc/humidity/cmd").unwrap();

        let publish = Publish::new("svc/thermostat/cmd", QoS::AtLeastOnce, Bytes::from_static(b"hi"), None);
        assert!(broker.deliver(publish).is_none());
    }
}
