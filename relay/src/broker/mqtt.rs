//! MQTT broker client built on rumqttc.
//!
//! Publishing goes through one long-lived connection whose event loop runs
//! in a background task. Every send is QoS 1 and resolves when the matching
//! PUBACK arrives. Subscriptions are short-lived sessions whose client id is
//! the consumer group, so the broker keeps one queue per group.

use super::{decode_payload, Broker, Subscription};
use crate::config::{BrokerArgs, OffsetReset};
use crate::errors::{ConsumeTransportError, PublishError};
use crate::metrics::SubscriptionGauge;
use crate::model::Ack;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10000;
const SUBSCRIPTION_CAPACITY: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Client id of the publishing connection.
    pub client_id: String,
    /// Bounds both the wait for a PUBACK and the wait for a SUBACK.
    pub request_timeout: Duration,
    pub offset_reset: OffsetReset,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            request_timeout: Duration::from_secs(5),
            offset_reset: OffsetReset::Earliest,
        }
    }

    pub fn from_args(args: &BrokerArgs, client_id: impl Into<String>) -> Self {
        Self {
            host: args.mqtt_broker.clone(),
            port: args.mqtt_port,
            client_id: client_id.into(),
            request_timeout: args.ack_timeout(),
            offset_reset: args.offset_reset,
        }
    }
}

type AckSender = oneshot::Sender<Result<u16, String>>;

/// Waiters for outstanding publishes.
///
/// rumqttc assigns packet ids when it writes a publish, in request order, so
/// a waiter is queued before its request and moved to `inflight` when the
/// next `Outgoing::Publish` is seen. Slots stay in place after a failure so
/// the ordering is never shifted.
#[derive(Debug, Default)]
struct PendingAcks {
    queued: VecDeque<Option<AckSender>>,
    inflight: HashMap<u16, Option<AckSender>>,
}

impl PendingAcks {
    fn written(&mut self, pkid: u16) {
        // A retransmission after reconnect reuses its packet id
        if self.inflight.contains_key(&pkid) {
            return;
        }
        if let Some(slot) = self.queued.pop_front() {
            self.inflight.insert(pkid, slot);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(Some(tx)) = self.inflight.remove(&pkid) {
            let _ = tx.send(Ok(pkid));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let slots = self
            .queued
            .iter_mut()
            .chain(self.inflight.values_mut());
        for slot in slots {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }
}

fn lock(pending: &Mutex<PendingAcks>) -> MutexGuard<'_, PendingAcks> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct PublishLink {
    client: AsyncClient,
    pending: Arc<Mutex<PendingAcks>>,
    // Keeps queue order equal to request order
    send_order: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PublishLink {
    fn start(settings: &MqttSettings) -> Self {
        info!(
            "Connecting publisher to MQTT broker at {}:{}",
            settings.host, settings.port
        );

        let mut mqtt_options =
            MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let pending = Arc::new(Mutex::new(PendingAcks::default()));
        let task = tokio::spawn(drive_publisher(eventloop, Arc::clone(&pending)));

        Self {
            client,
            pending,
            send_order: tokio::sync::Mutex::new(()),
            task: Mutex::new(Some(task)),
        }
    }
}

async fn drive_publisher(mut eventloop: EventLoop, pending: Arc<Mutex<PendingAcks>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&pending).written(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => lock(&pending).acked(ack.pkid),
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Publisher connected to MQTT broker"),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Publisher disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT publisher eventloop error: {}", e);
                lock(&pending).fail_all(&e.to_string());
                // rumqttc reconnects on the next poll
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

/// Process-wide MQTT client. Create once at start-up and call
/// [`Broker::shutdown`] before exit.
#[derive(Debug)]
pub struct MqttBroker {
    settings: MqttSettings,
    publisher: OnceCell<PublishLink>,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            publisher: OnceCell::new(),
        }
    }

    async fn publish_link(&self) -> &PublishLink {
        self.publisher
            .get_or_init(|| async { PublishLink::start(&self.settings) })
            .await
    }
}

#[async_trait]
impl Broker for MqttBroker {
    type Subscription = MqttSubscription;

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError> {
        let link = self.publish_link().await;
        let (tx, rx) = oneshot::channel();

        {
            let _order = link.send_order.lock().await;
            lock(&link.pending).queued.push_back(Some(tx));
            if let Err(e) = link
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                // The request never reached the event loop
                lock(&link.pending).queued.pop_back();
                return Err(e.into());
            }
        }

        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(pkid))) => Ok(Ack {
                topic: topic.to_string(),
                delivery_id: u64::from(pkid),
            }),
            Ok(Ok(Err(reason))) => Err(PublishError::Broker(reason)),
            Ok(Err(_)) => Err(PublishError::Broker(
                "publisher connection closed".to_string(),
            )),
            Err(_) => Err(PublishError::AckTimeout(timeout)),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<MqttSubscription, ConsumeTransportError> {
        debug!(topic, group_id, "Opening MQTT subscription");

        let mut mqtt_options = MqttOptions::new(group_id, &self.settings.host, self.settings.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        // A persistent session makes the broker queue messages for the group
        // between consume calls.
        mqtt_options.set_clean_session(self.settings.offset_reset == OffsetReset::Latest);
        mqtt_options.set_manual_acks(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, SUBSCRIPTION_CAPACITY);
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ConsumeTransportError::Subscribe(e.to_string()))?;

        // A resumed session may deliver queued messages before the SUBACK.
        let mut buffered = VecDeque::new();
        let confirm = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        if ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure))
                        {
                            return Err(ConsumeTransportError::Subscribe(format!(
                                "broker rejected subscription to {}",
                                topic
                            )));
                        }
                        return Ok(());
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => buffered.push_back(publish),
                    Ok(_) => {}
                    Err(e) => return Err(ConsumeTransportError::Subscribe(e.to_string())),
                }
            }
        };

        match tokio::time::timeout(self.settings.request_timeout, confirm).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ConsumeTransportError::Subscribe(format!(
                    "no SUBACK within {:?}",
                    self.settings.request_timeout
                )))
            }
        }

        info!(topic, group_id, "Subscribed with QoS 1");

        Ok(MqttSubscription {
            topic: topic.to_string(),
            client,
            eventloop,
            buffered,
            closed: false,
            _gauge: SubscriptionGauge::acquire(),
        })
    }

    async fn shutdown(&self) {
        let Some(link) = self.publisher.get() else {
            return;
        };
        if let Err(e) = link.client.disconnect().await {
            warn!("Failed to request MQTT disconnect: {}", e);
        }
        let task = link
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Publisher eventloop did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// One consumer-group session on a single topic.
pub struct MqttSubscription {
    topic: String,
    client: AsyncClient,
    eventloop: EventLoop,
    buffered: VecDeque<Publish>,
    closed: bool,
    _gauge: SubscriptionGauge,
}

async fn deliver(client: &AsyncClient, publish: Publish) -> Result<String, ConsumeTransportError> {
    let decoded = decode_payload(&publish.payload);
    // Acked even when undecodable so a bad payload is not redelivered forever
    client
        .ack(&publish)
        .await
        .map_err(|e| ConsumeTransportError::Connection(e.to_string()))?;
    decoded
}

#[async_trait]
impl Subscription for MqttSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<String>, ConsumeTransportError> {
        if let Some(publish) = self.buffered.pop_front() {
            return deliver(&self.client, publish).await.map(Some);
        }

        let Self {
            topic,
            client,
            eventloop,
            ..
        } = &mut *self;

        let next = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == *topic => {
                        return Ok(publish)
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        // Left over from an older subscription of this session
                        debug!(topic = %publish.topic, "Skipping message on foreign topic");
                        if let Err(e) = client.ack(&publish).await {
                            return Err(ConsumeTransportError::Connection(e.to_string()));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => return Err(ConsumeTransportError::from(e)),
                }
            }
        };

        match tokio::time::timeout(timeout, next).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e),
            Ok(Ok(publish)) => deliver(&self.client, publish).await.map(Some),
        }
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to request MQTT disconnect: {}", e);
            return;
        }

        // Flush pending acks and the DISCONNECT itself
        let eventloop = &mut self.eventloop;
        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(topic = %self.topic, "Subscription did not disconnect cleanly");
        }
    }
}

impl Drop for MqttSubscription {
    fn drop(&mut self) {
        if !self.closed {
            // Dropping the event loop closes the socket; this only tells the
            // broker when the request can still be queued.
            let _ = self.client.try_disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_acks_resolve_in_order() {
        let mut pending = PendingAcks::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.queued.push_back(Some(tx1));
        pending.queued.push_back(Some(tx2));

        pending.written(7);
        pending.written(8);
        pending.acked(8);
        assert_eq!(rx2.try_recv().unwrap(), Ok(8));
        assert!(rx1.try_recv().is_err());

        pending.acked(7);
        assert_eq!(rx1.try_recv().unwrap(), Ok(7));
    }

    #[test]
    fn test_retransmission_does_not_shift_queue() {
        let mut pending = PendingAcks::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.queued.push_back(Some(tx1));
        pending.queued.push_back(Some(tx2));

        pending.written(1);
        pending.written(1);
        pending.written(2);
        pending.acked(2);
        assert_eq!(rx2.try_recv().unwrap(), Ok(2));
    }

    #[test]
    fn test_fail_all_keeps_slots() {
        let mut pending = PendingAcks::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let (tx3, mut rx3) = oneshot::channel();
        pending.queued.push_back(Some(tx1));
        pending.written(1);
        pending.queued.push_back(Some(tx2));

        pending.fail_all("connection refused");
        assert_eq!(rx1.try_recv().unwrap(), Err("connection refused".to_string()));
        assert_eq!(rx2.try_recv().unwrap(), Err("connection refused".to_string()));

        // The failed request is still written later; the next waiter keeps its place
        pending.queued.push_back(Some(tx3));
        pending.written(2);
        pending.written(3);
        pending.acked(3);
        assert_eq!(rx3.try_recv().unwrap(), Ok(3));
    }

    #[test]
    fn test_settings_from_args() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            broker: BrokerArgs,
        }

        let cli = Cli::parse_from([
            "test",
            "--mqtt-broker",
            "mqtt.local",
            "--mqtt-port",
            "1884",
            "--ack-timeout-ms",
            "250",
        ]);
        let settings = MqttSettings::from_args(&cli.broker, "monitoring-1");
        assert_eq!(settings.host, "mqtt.local");
        assert_eq!(settings.port, 1884);
        assert_eq!(settings.client_id, "monitoring-1");
        assert_eq!(settings.request_timeout, Duration::from_millis(250));
    }
}
