// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A thin [`ManagedClient`] adapter over [`rumqttc`]'s v5 client and event loop.
//!
//! `rumqttc` hands back one [`rumqttc::v5::EventLoop`] for the whole connection; this module
//! drives it on a background task and fans incoming publishes out to every
//! [`RumqttcPubReceiver`] whose registered topic filter matches, mirroring the dispatcher a
//! session-managed client is expected to provide per [`crate::interface::ManagedClient`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use tokio::sync::mpsc;

use crate::control_packet::{Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties};
use crate::error::ClientError;
use crate::interface::{CompletionToken, ManagedClient, MqttPubSub, PubReceiver, RumqttcAckToken};

/// Returns `true` if `topic` (a concrete topic name) matches `filter` (which may contain `+`
/// single-level and `#` multi-level wildcards), per the MQTT topic-matching rules.
#[must_use]
pub(crate) fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (topic_levels.next(), filter_levels.next()) {
            (Some(_), Some("#")) => return true,
            (Some(t), Some("+")) => {
                let _ = t;
            }
            (Some(t), Some(f)) if t == f => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

type PublishTx = mpsc::UnboundedSender<(Publish, Option<RumqttcAckToken>)>;

#[derive(Default)]
struct Dispatcher {
    filtered: HashMap<String, Vec<PublishTx>>,
}

impl Dispatcher {
    fn register(&mut self, filter: &str) -> mpsc::UnboundedReceiver<(Publish, Option<RumqttcAckToken>)> {
        self.filtered.retain(|_, txs| {
            txs.retain(|tx| !tx.is_closed());
            !txs.is_empty()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        self.filtered.entry(filter.to_string()).or_default().push(tx);
        rx
    }

    fn dispatch(&self, publish: &Publish, client: &AsyncClient) {
        let matching: Vec<&PublishTx> = self
            .filtered
            .iter()
            .filter(|(filter, _)| topic_matches_filter(&publish.topic, filter))
            .flat_map(|(_, txs)| txs.iter())
            .collect();

        if matching.is_empty() {
            return;
        }

        // Every matching receiver gets its own ack handle; only the last one consumes the real
        // manual ack (in practice exactly one receiver per packet is registered for
        // request/response/telemetry topics, since each owns a distinct topic filter).
        let last_index = matching.len() - 1;
        for (i, tx) in matching.into_iter().enumerate() {
            let ack = if i == last_index {
                Some(RumqttcAckToken {
                    ack: Some(client.get_manual_ack(publish)),
                    client: client.clone(),
                })
            } else {
                None
            };
            let _ = tx.send((publish.clone(), ack));
        }
    }
}

/// A [`ManagedClient`] backed by a `rumqttc` v5 `AsyncClient`, with its `EventLoop` driven on a
/// spawned task that this adapter owns.
#[derive(Clone)]
pub struct RumqttcManagedClient {
    client_id: String,
    client: AsyncClient,
    dispatcher: Arc<Mutex<Dispatcher>>,
}

impl RumqttcManagedClient {
    /// Wraps `client`, driving `event_loop` on a background task for the lifetime of the
    /// returned value (and every clone of it).
    #[must_use]
    pub fn new(client_id: impl Into<String>, client: AsyncClient, mut event_loop: EventLoop) -> Self {
        let dispatcher = Arc::new(Mutex::new(Dispatcher::default()));
        let dispatcher_clone = Arc::clone(&dispatcher);
        let client_clone = client.clone();

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(rumqttc::v5::Event::Incoming(Packet::Publish(publish))) => {
                        let dispatcher = dispatcher_clone.lock().expect("dispatcher mutex poisoned");
                        dispatcher.dispatch(&publish, &client_clone);
                    }
                    Ok(_) => {}
                    Err(ConnectionError::RequestsDone) => break,
                    Err(e) => {
                        log::warn!("mqtt event loop error: {e}");
                    }
                }
            }
        });

        Self {
            client_id: client_id.into(),
            client,
            dispatcher,
        }
    }
}

#[async_trait]
impl MqttPubSub for RumqttcManagedClient {
    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Bytes) -> Result<CompletionToken, ClientError> {
        let notice = self.client.publish(topic, qos, retain, payload).await?;
        Ok(CompletionToken::Pending(notice))
    }

    async fn publish_with_properties(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: PublishProperties,
    ) -> Result<CompletionToken, ClientError> {
        let notice = self
            .client
            .publish_with_properties(topic, qos, retain, payload, properties)
            .await?;
        Ok(CompletionToken::Pending(notice))
    }

    async fn subscribe_with_properties(
        &self,
        topic: String,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        let notice = self.client.subscribe_with_properties(topic, qos, properties).await?;
        Ok(CompletionToken::Pending(notice))
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: String,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        let notice = self.client.unsubscribe_with_properties(topic, properties).await?;
        Ok(CompletionToken::Pending(notice))
    }
}

impl ManagedClient for RumqttcManagedClient {
    type PubReceiver = RumqttcPubReceiver;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn create_filtered_pub_receiver(&self, topic_filter: &str) -> Result<Self::PubReceiver, ClientError> {
        if topic_filter.is_empty() {
            return Err(ClientError::InvalidTopicFilter(topic_filter.to_string()));
        }
        let rx = self.dispatcher.lock().expect("dispatcher mutex poisoned").register(topic_filter);
        Ok(RumqttcPubReceiver { rx })
    }
}

/// A [`PubReceiver`] fed by [`RumqttcManagedClient`]'s dispatch task.
pub struct RumqttcPubReceiver {
    rx: mpsc::UnboundedReceiver<(Publish, Option<RumqttcAckToken>)>,
}

#[async_trait]
impl PubReceiver for RumqttcPubReceiver {
    type AckToken = RumqttcAckToken;

    async fn recv(&mut self) -> Option<(Publish, Option<RumqttcAckToken>)> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_matches_itself() {
        assert!(topic_matches_filter("svc/thermostat/cmd", "svc/thermostat/cmd"));
    }

    #[test]
    fn plus_matches_single_level() {
        assert!(topic_matches_filter("svc/thermostat/cmd", "svc/+/cmd"));
        assert!(!topic_matches_filter("svc/thermostat/extra/cmd", "svc/+/cmd"));
    }

    #[test]
    fn hash_matches_remaining_levels() {
        assert!(topic_matches_filter("svc/thermostat/cmd/set", "svc/#"));
        assert!(topic_matches_filter("svc", "svc/#"));
    }

    #[test]
    fn mismatched_literal_does_not_match() {
        assert!(!topic_matches_filter("svc/humidity/cmd", "svc/thermostat/cmd"));
    }
}
