// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT integration.
//!
//! One broker connection. Every event is published to the topic rendered
//! from the topic template and the call waits for the broker's
//! acknowledgement. An optional fixed downlink topic is subscribed at QoS 1;
//! inbound messages are relayed fire-and-forget.
//!
//! Startup does not return until the broker accepted the connection: failed
//! attempts are retried forever with the configured backoff, unless the
//! shutdown token is cancelled.

use super::{Event, Integration, IntegrationError, IntegrationOptions};
use crate::backoff::{Backoff, BackoffConfig};
use crate::config::MqttConfig;
use crate::downlink::DownlinkContext;
use crate::error_channel::{ErrorSender, HandleError};
use crate::template::DestinationTemplate;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event as MqttEvent, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, QoS, Request, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "mqtt";
const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;

/// Publish side of an MQTT connection.
pub trait MqttTransport: Send + Sync + 'static {
    /// Publish non-retained and wait for the broker's acknowledgement.
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), IntegrationError>> + Send;

    /// Disconnect, draining outstanding work for a bounded time.
    fn disconnect(&self) -> impl Future<Output = Result<(), IntegrationError>> + Send;
}

/// Split a broker URL into host and port.
///
/// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and `host`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), IntegrationError> {
    let trimmed = url.trim();
    let address = trimmed
        .strip_prefix("tcp://")
        .or_else(|| trimmed.strip_prefix("mqtt://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    if address.contains("://") {
        return Err(IntegrationError::Config(format!(
            "unsupported broker URL scheme: {}",
            url
        )));
    }

    let (host, port) = match address.split_once(':') {
        None => (address, DEFAULT_PORT),
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                IntegrationError::Config(format!("invalid port in broker URL: {}", url))
            })?;
            (host, port)
        }
    };

    if host.is_empty() {
        return Err(IntegrationError::Config(format!(
            "missing host in broker URL: {}",
            url
        )));
    }
    Ok((host.to_string(), port))
}

/// Map a configured QoS level.
pub fn qos_from_u8(qos: u8) -> Result<QoS, IntegrationError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(IntegrationError::Config(format!("invalid QoS {}", other))),
    }
}

type Waiter = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct AckState {
    queued: VecDeque<Waiter>,
    inflight: HashMap<u16, Waiter>,
}

/// Matches publish requests with broker acknowledgements.
///
/// Requests reach the wire in submission order, so the n-th outgoing
/// PUBLISH belongs to the n-th queued waiter. QoS 0 completes when written;
/// QoS 1 and 2 complete on PUBACK / PUBCOMP for the packet id.
#[derive(Default)]
struct AckTracker {
    state: std::sync::Mutex<AckState>,
}

impl AckTracker {
    fn state(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.state().queued.push_back(tx);
        rx
    }

    fn dequeue_last(&self) {
        self.state().queued.pop_back();
    }

    fn sent(&self, pkid: u16) {
        let mut state = self.state();
        let Some(waiter) = state.queued.pop_front() else {
            return;
        };
        if pkid == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            state.inflight.insert(pkid, waiter);
        }
    }

    fn complete(&self, pkid: u16) {
        if let Some(waiter) = self.state().inflight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Connection lost and the session's parked requests were discarded.
    ///
    /// Every inflight waiter fails, as do the first `unsent` queued waiters
    /// (publishes taken off the request channel before reaching the wire).
    /// Later waiters keep their place; their requests are still queued.
    fn session_lost(&self, unsent: usize, reason: &str) {
        let mut guard = self.state();
        let state = &mut *guard;
        let unsent = unsent.min(state.queued.len());
        for waiter in state
            .inflight
            .drain()
            .map(|(_, w)| w)
            .chain(state.queued.drain(..unsent))
        {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    fn fail_all(&self, reason: &str) {
        let mut guard = self.state();
        let state = &mut *guard;
        for waiter in state
            .queued
            .drain(..)
            .chain(state.inflight.drain().map(|(_, w)| w))
        {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }
}

/// [`MqttTransport`] over `rumqttc`.
pub struct RumqttTransport {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    publish_order: Mutex<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    quiesce: Duration,
}

impl RumqttTransport {
    /// Connect, retrying until the broker accepts or `shutdown` fires, then
    /// subscribe to the downlink topic if one is given.
    pub async fn connect(
        config: &MqttConfig,
        downlink: Option<(String, DownlinkContext)>,
        shutdown: &CancellationToken,
    ) -> Result<Self, IntegrationError> {
        let (host, port) = parse_broker_url(&config.url)?;
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("event-forward-{}", std::process::id()));

        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let mut backoff = Backoff::new(config.reconnect);
        loop {
            tracing::info!("Connecting to MQTT broker {}:{}", host, port);
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return Err(IntegrationError::Cancelled),
                result = wait_for_connack(&mut eventloop) => result,
            };
            match attempt {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!("MQTT connect to {}:{} failed, will retry: {}", host, port, e);
                    if !backoff.wait(shutdown).await {
                        return Err(IntegrationError::Cancelled);
                    }
                }
            }
        }
        tracing::info!("Connected to MQTT broker {}:{}", host, port);

        let (resubscribe, inbound) = match downlink {
            Some((topic, ctx)) => {
                tracing::info!("Subscribing to downlink topic {}", topic);
                client
                    .subscribe(topic.clone(), QoS::AtLeastOnce)
                    .await
                    .map_err(|e| IntegrationError::Subscribe(e.to_string()))?;
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(IntegrationError::Cancelled),
                    result = wait_for_suback(&mut eventloop, &topic) => result?,
                }
                (Some((client.clone(), topic)), Some(ctx))
            }
            None => (None, None),
        };

        let acks = Arc::new(AckTracker::default());
        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            acks.clone(),
            inbound,
            resubscribe,
            config.reconnect,
        ));

        Ok(Self {
            client,
            acks,
            publish_order: Mutex::new(()),
            event_loop: Mutex::new(Some(handle)),
            quiesce: Duration::from_millis(config.quiesce_ms),
        })
    }
}

impl MqttTransport for RumqttTransport {
    async fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<(), IntegrationError> {
        let done = {
            let _order = self.publish_order.lock().await;
            let done = self.acks.enqueue();
            if let Err(e) = self.client.publish(topic, qos, false, payload.to_vec()).await {
                self.acks.dequeue_last();
                return Err(IntegrationError::Publish(e.to_string()));
            }
            done
        };

        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(IntegrationError::Publish(reason)),
            Err(_) => Err(IntegrationError::Publish("connection closed".into())),
        }
    }

    async fn disconnect(&self) -> Result<(), IntegrationError> {
        let Some(mut handle) = self.event_loop.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("MQTT disconnect request failed: {}", e);
        }
        if tokio::time::timeout(self.quiesce, &mut handle).await.is_err() {
            tracing::warn!(
                "MQTT event loop did not drain within {:?}, aborting",
                self.quiesce
            );
            handle.abort();
        }

        self.acks.fail_all("connection closed");
        tracing::info!("MQTT connection closed");
        Ok(())
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let MqttEvent::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn wait_for_suback(eventloop: &mut EventLoop, topic: &str) -> Result<(), IntegrationError> {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(IntegrationError::Subscribe(format!(
                        "broker rejected subscription to {}",
                        topic
                    )));
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(IntegrationError::Subscribe(e.to_string())),
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    acks: Arc<AckTracker>,
    inbound: Option<DownlinkContext>,
    resubscribe: Option<(AsyncClient, String)>,
    reconnect: BackoffConfig,
) {
    let mut backoff = Backoff::new(reconnect);
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                dispatch_inbound(inbound.as_ref(), publish);
            }
            Ok(MqttEvent::Incoming(Packet::PubAck(ack))) => acks.complete(ack.pkid),
            Ok(MqttEvent::Incoming(Packet::PubComp(comp))) => acks.complete(comp.pkid),
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Reconnected to MQTT broker");
                backoff.reset();
                if let Some((client, topic)) = &resubscribe {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        tracing::warn!("Failed to resubscribe to {}: {}", topic, e);
                    }
                }
            }
            Ok(MqttEvent::Outgoing(Outgoing::Publish(pkid))) => acks.sent(pkid),
            Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                let unsent = discard_parked(&mut eventloop);
                acks.session_lost(unsent, &e.to_string());
                let delay = backoff.next_delay();
                tracing::warn!("MQTT connection lost, reconnecting in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
    acks.fail_all("connection closed");
}

/// Drop what rumqttc parked for replay after a connection error.
///
/// Replayed publishes would consume the acknowledgements of newer ones, so a
/// failed publish must mean a dropped publish. Returns how many parked
/// publishes never got a packet id, i.e. were never written.
fn discard_parked(eventloop: &mut EventLoop) -> usize {
    let unsent = eventloop
        .pending
        .iter()
        .filter(|request| matches!(request, Request::Publish(p) if p.pkid == 0))
        .count();
    if !eventloop.pending.is_empty() {
        tracing::debug!("Discarding {} parked MQTT requests", eventloop.pending.len());
        eventloop.pending.clear();
    }
    unsent
}

fn dispatch_inbound(inbound: Option<&DownlinkContext>, publish: Publish) {
    match inbound {
        Some(ctx) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.relay(SOURCE, &publish.payload).await;
            });
        }
        None => tracing::debug!("Ignoring MQTT message on {}", publish.topic),
    }
}

/// Push-style integration.
pub struct MqttIntegration<T: MqttTransport = RumqttTransport> {
    transport: T,
    topic: DestinationTemplate,
    qos: QoS,
    closed: AtomicBool,
}

impl MqttIntegration<RumqttTransport> {
    /// Validate, compile the topic template, and connect.
    pub async fn new(config: &MqttConfig, options: &IntegrationOptions) -> Result<Self, IntegrationError> {
        if config.url.trim().is_empty() {
            return Err(IntegrationError::Config("empty mqtt url".into()));
        }
        let topic = DestinationTemplate::compile(&config.topic_template)?;
        let qos = qos_from_u8(config.qos)?;

        let downlink_topic = config.downlink_topic.trim();
        let downlink = match &options.relay {
            _ if downlink_topic.is_empty() => None,
            Some(relay) => Some((
                downlink_topic.to_string(),
                DownlinkContext::new(relay.clone(), options.errors.clone()),
            )),
            None => {
                tracing::warn!(
                    "MQTT downlink topic {} set without a network server, not subscribing",
                    downlink_topic
                );
                None
            }
        };

        let transport = RumqttTransport::connect(config, downlink, &options.shutdown).await?;
        Ok(Self::from_parts(transport, topic, qos))
    }
}

impl<T: MqttTransport> MqttIntegration<T> {
    /// Build over an already connected transport.
    pub fn with_transport(config: &MqttConfig, transport: T) -> Result<Self, IntegrationError> {
        let topic = DestinationTemplate::compile(&config.topic_template)?;
        let qos = qos_from_u8(config.qos)?;
        Ok(Self::from_parts(transport, topic, qos))
    }

    fn from_parts(transport: T, topic: DestinationTemplate, qos: QoS) -> Self {
        tracing::debug!(
            "mqtt: topic template {:?} uses {:?}",
            topic.source(),
            topic.variables().collect::<Vec<_>>()
        );
        Self {
            transport,
            topic,
            qos,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<T: MqttTransport> Integration for MqttIntegration<T> {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn handle_event(&self, errors: &ErrorSender, event: &Event) -> Result<(), HandleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HandleError::new(SOURCE, IntegrationError::Closed));
        }

        let topic = match self.topic.render_destination(&event.vars) {
            Ok(topic) => topic,
            Err(e) => {
                errors.report(HandleError::new(SOURCE, e));
                return Ok(());
            }
        };
        tracing::debug!("mqtt: publishing {} bytes to {}", event.payload.len(), topic);

        self.transport
            .publish(&topic, self.qos, &event.payload)
            .await
            .map_err(|e| HandleError::new(SOURCE, e))
    }

    async fn close(&self) -> Result<(), HandleError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transport
            .disconnect()
            .await
            .map_err(|e| HandleError::new(SOURCE, e))
    }
}
