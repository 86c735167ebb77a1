// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pulsar integration.
//!
//! Events fan out to an open set of topics. Topic and producer name are
//! rendered per event from two templates; producers are pooled by name and
//! sends complete in the background, failures landing on the error channel.
//!
//! When a relay is configured the integration also runs a key-shared
//! consumer over a topic regex and relays downlink commands, acking only
//! those the network server accepted.

use super::producer_pool::ProducerPool;
use super::{Event, Integration, IntegrationError, IntegrationOptions};
use crate::config::PulsarConfig;
use crate::downlink::DownlinkContext;
use crate::error_channel::{ErrorSender, HandleError};
use crate::template::DestinationTemplate;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use pulsar::{
    Authentication, ConnectionRetryOptions, OperationRetryOptions, Pulsar, SubType,
    TokioExecutor,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "pulsar";
const DEFAULT_NAMESPACE: &str = "public/default";

/// Completion of a submitted message.
pub type PendingDelivery = BoxFuture<'static, Result<(), IntegrationError>>;

/// Send side of one pooled producer.
pub trait EventProducer: Send + 'static {
    /// Enqueue a payload. The returned future resolves once the broker
    /// confirmed (or rejected) it.
    fn send(
        &mut self,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<PendingDelivery, IntegrationError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), IntegrationError>> + Send;
}

/// Receive side of the downlink subscription.
pub trait DownlinkConsumer: Send + 'static {
    type Message: Send + Sync;

    /// Next message. `None` once the consumer is closed.
    fn receive(
        &mut self,
    ) -> impl Future<Output = Option<Result<Self::Message, IntegrationError>>> + Send;

    fn payload(message: &Self::Message) -> &[u8];

    fn ack(
        &mut self,
        message: &Self::Message,
    ) -> impl Future<Output = Result<(), IntegrationError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), IntegrationError>> + Send;
}

/// Producer and consumer factory.
pub trait PulsarBackend: Send + Sync + 'static {
    type Producer: EventProducer;
    type Consumer: DownlinkConsumer;

    fn create_producer(
        &self,
        topic: &str,
        name: &str,
    ) -> impl Future<Output = Result<Self::Producer, IntegrationError>> + Send;

    fn subscribe(
        &self,
        topics_pattern: &str,
        consumer_name: &str,
        subscription: &str,
    ) -> impl Future<Output = Result<Self::Consumer, IntegrationError>> + Send;
}

/// [`PulsarBackend`] over the `pulsar` crate.
#[derive(Clone)]
pub struct PulsarClient {
    pulsar: Pulsar<TokioExecutor>,
}

impl PulsarClient {
    /// Connect once. No retry.
    pub async fn connect(config: &PulsarConfig) -> Result<Self, IntegrationError> {
        let mut builder = Pulsar::builder(config.url.trim(), TokioExecutor)
            .with_connection_retry_options(ConnectionRetryOptions {
                connection_timeout: Duration::from_secs(config.connection_timeout_secs),
                ..Default::default()
            })
            .with_operation_retry_options(OperationRetryOptions {
                operation_timeout: Duration::from_secs(config.operation_timeout_secs),
                ..Default::default()
            });

        if let Some(token) = config.auth_token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.with_auth(Authentication {
                name: "token".to_string(),
                data: token.as_bytes().to_vec(),
            });
        }

        let pulsar = builder
            .build()
            .await
            .map_err(|e| IntegrationError::Connect(e.to_string()))?;

        tracing::info!("Connected to Pulsar at {}", config.url);
        Ok(Self { pulsar })
    }
}

impl PulsarBackend for PulsarClient {
    type Producer = PulsarProducer;
    type Consumer = PulsarConsumer;

    async fn create_producer(&self, topic: &str, name: &str) -> Result<PulsarProducer, IntegrationError> {
        let inner = self
            .pulsar
            .producer()
            .with_topic(topic)
            .with_name(name)
            .build()
            .await
            .map_err(|e| IntegrationError::Producer(format!("{} ({}): {}", name, topic, e)))?;

        tracing::info!("Created Pulsar producer {} on {}", name, topic);
        Ok(PulsarProducer { inner })
    }

    async fn subscribe(
        &self,
        topics_pattern: &str,
        consumer_name: &str,
        subscription: &str,
    ) -> Result<PulsarConsumer, IntegrationError> {
        let namespace = lookup_namespace(topics_pattern)?;
        let regex = regex::Regex::new(topics_pattern)
            .map_err(|e| IntegrationError::Config(format!("topics_pattern: {}", e)))?;

        let inner = self
            .pulsar
            .consumer()
            .with_lookup_namespace(namespace)
            .with_topic_regex(regex)
            .with_consumer_name(consumer_name)
            .with_subscription_type(SubType::KeyShared)
            .with_subscription(subscription)
            .build::<Vec<u8>>()
            .await
            .map_err(|e| IntegrationError::Subscribe(e.to_string()))?;

        Ok(PulsarConsumer { inner })
    }
}

/// Namespace whose topics a downlink pattern is matched against.
///
/// `persistent://tenant/ns/<regex>` and `tenant/ns/<regex>` name their
/// namespace; a bare regex is matched in `public/default`.
pub fn lookup_namespace(topics_pattern: &str) -> Result<String, IntegrationError> {
    let pattern = topics_pattern.trim();
    let (path, qualified) = match pattern
        .strip_prefix("persistent://")
        .or_else(|| pattern.strip_prefix("non-persistent://"))
    {
        Some(path) => (path, true),
        None => (pattern, false),
    };

    match path.splitn(3, '/').collect::<Vec<_>>().as_slice() {
        [tenant, namespace, topic]
            if is_namespace_part(tenant) && is_namespace_part(namespace) && !topic.is_empty() =>
        {
            Ok(format!("{}/{}", tenant, namespace))
        }
        [topic] if !qualified && !topic.is_empty() => Ok(DEFAULT_NAMESPACE.to_string()),
        _ => Err(IntegrationError::Config(format!(
            "topics_pattern must be <regex> or persistent://<tenant>/<namespace>/<regex>: {}",
            topics_pattern
        ))),
    }
}

fn is_namespace_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '='))
}

pub struct PulsarProducer {
    inner: pulsar::Producer<TokioExecutor>,
}

impl EventProducer for PulsarProducer {
    async fn send(&mut self, payload: Vec<u8>) -> Result<PendingDelivery, IntegrationError> {
        let receipt = self
            .inner
            .send_non_blocking(payload)
            .await
            .map_err(|e| IntegrationError::Send(e.to_string()))?;

        Ok(Box::pin(async move {
            receipt
                .await
                .map(|_| ())
                .map_err(|e| IntegrationError::Send(e.to_string()))
        }))
    }

    async fn close(&mut self) -> Result<(), IntegrationError> {
        self.inner
            .close()
            .await
            .map_err(|e| IntegrationError::Producer(e.to_string()))
    }
}

pub struct PulsarConsumer {
    inner: pulsar::Consumer<Vec<u8>, TokioExecutor>,
}

impl DownlinkConsumer for PulsarConsumer {
    type Message = pulsar::consumer::Message<Vec<u8>>;

    async fn receive(&mut self) -> Option<Result<Self::Message, IntegrationError>> {
        self.inner
            .next()
            .await
            .map(|r| r.map_err(|e| IntegrationError::Receive(e.to_string())))
    }

    fn payload(message: &Self::Message) -> &[u8] {
        &message.payload.data
    }

    async fn ack(&mut self, message: &Self::Message) -> Result<(), IntegrationError> {
        self.inner
            .ack(message)
            .await
            .map_err(|e| IntegrationError::Ack(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), IntegrationError> {
        self.inner
            .close()
            .await
            .map_err(|e| IntegrationError::Subscribe(e.to_string()))
    }
}

struct DownlinkTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Producer-pooling integration.
pub struct PulsarIntegration<B: PulsarBackend = PulsarClient> {
    backend: B,
    topic: DestinationTemplate,
    producer_name: DestinationTemplate,
    producers: ProducerPool<B::Producer>,
    downlink: Mutex<Option<DownlinkTask>>,
    /// Held shared by every `handle_event`; `close` takes it exclusively so
    /// no producer is created after the pool was drained.
    closed: RwLock<bool>,
}

impl PulsarIntegration<PulsarClient> {
    /// Compile templates, connect, and start the downlink loop if configured.
    pub async fn new(config: &PulsarConfig, options: &IntegrationOptions) -> Result<Self, IntegrationError> {
        if config.url.trim().is_empty() {
            return Err(IntegrationError::Config("empty pulsar url".into()));
        }
        let (topic, producer_name) = compile_templates(config)?;
        let backend = PulsarClient::connect(config).await?;
        Self::assemble(config, backend, topic, producer_name, options).await
    }
}

impl<B: PulsarBackend> PulsarIntegration<B> {
    /// Build over an arbitrary backend.
    pub async fn with_backend(
        config: &PulsarConfig,
        backend: B,
        options: &IntegrationOptions,
    ) -> Result<Self, IntegrationError> {
        let (topic, producer_name) = compile_templates(config)?;
        Self::assemble(config, backend, topic, producer_name, options).await
    }

    async fn assemble(
        config: &PulsarConfig,
        backend: B,
        topic: DestinationTemplate,
        producer_name: DestinationTemplate,
        options: &IntegrationOptions,
    ) -> Result<Self, IntegrationError> {
        let downlink = match &options.relay {
            Some(relay) if config.downlink_configured() => {
                let consumer = backend
                    .subscribe(
                        &config.topics_pattern,
                        &config.consumer_name,
                        &config.subscription_name,
                    )
                    .await?;
                tracing::info!(
                    "Subscribed to {} as {} ({})",
                    config.topics_pattern,
                    config.consumer_name,
                    config.subscription_name
                );

                let ctx = DownlinkContext::new(relay.clone(), options.errors.clone());
                let cancel = options.shutdown.child_token();
                let handle = tokio::spawn(consume_downlinks(consumer, ctx, cancel.clone()));
                Some(DownlinkTask { cancel, handle })
            }
            Some(_) => {
                tracing::warn!(
                    "Pulsar downlink disabled: topics_pattern, consumer_name and subscription_name are all required"
                );
                None
            }
            None => None,
        };

        Ok(Self {
            backend,
            topic,
            producer_name,
            producers: ProducerPool::new(),
            downlink: Mutex::new(downlink),
            closed: RwLock::new(false),
        })
    }

    /// Number of pooled producers.
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    fn resolve(&self, event: &Event) -> Result<(String, String), IntegrationError> {
        let topic = self.topic.render_destination(&event.vars)?;
        let name = self.producer_name.render_destination(&event.vars)?;
        Ok((topic, name))
    }
}

fn compile_templates(
    config: &PulsarConfig,
) -> Result<(DestinationTemplate, DestinationTemplate), IntegrationError> {
    let topic = DestinationTemplate::compile(&config.topic_template)?;
    let producer_name = DestinationTemplate::compile(&config.producer_name_template)?;
    for (role, template) in [("topic", &topic), ("producer name", &producer_name)] {
        tracing::debug!(
            "pulsar: {} template {:?} uses {:?}",
            role,
            template.source(),
            template.variables().collect::<Vec<_>>()
        );
    }
    Ok((topic, producer_name))
}

#[async_trait]
impl<B: PulsarBackend> Integration for PulsarIntegration<B> {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn handle_event(&self, errors: &ErrorSender, event: &Event) -> Result<(), HandleError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(HandleError::new(SOURCE, IntegrationError::Closed));
        }

        let (topic, name) = match self.resolve(event) {
            Ok(resolved) => resolved,
            Err(e) => {
                errors.report(HandleError::new(SOURCE, e));
                return Ok(());
            }
        };
        tracing::debug!("pulsar: topic {} producer {}", topic, name);

        let producer = self
            .producers
            .get_or_create(&name, || self.backend.create_producer(&topic, &name))
            .await
            .map_err(|e| HandleError::new(SOURCE, e))?;

        let submitted = producer.lock().await.send(event.payload.clone()).await;
        match submitted {
            Ok(delivery) => {
                let errors = errors.clone();
                tokio::spawn(async move {
                    if let Err(e) = delivery.await {
                        errors.report(HandleError::new(SOURCE, e));
                    }
                });
            }
            Err(e) => errors.report(HandleError::new(SOURCE, e)),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), HandleError> {
        {
            let mut closed = self.closed.write().await;
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        if let Some(task) = self.downlink.lock().await.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!("Pulsar downlink task ended abnormally: {}", e);
            }
        }

        let mut first_error = None;
        for producer in self.producers.drain() {
            if let Err(e) = producer.lock().await.close().await {
                tracing::warn!("Failed to close Pulsar producer: {}", e);
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Pulsar integration closed");
        match first_error {
            Some(e) => Err(HandleError::new(SOURCE, e)),
            None => Ok(()),
        }
    }
}

/// Downlink consumption loop.
///
/// Runs until `cancel` fires or the consumer ends. Messages are acked only
/// after the relay accepted them; decode and relay failures are reported and
/// left unacked for redelivery. Receive errors never stop the loop. The
/// consumer is closed on exit.
pub async fn consume_downlinks<C: DownlinkConsumer>(
    mut consumer: C,
    ctx: DownlinkContext,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = consumer.receive() => received,
        };

        let message = match received {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::warn!("Pulsar receive error: {}", e);
                continue;
            }
            None => {
                tracing::info!("Pulsar downlink consumer ended");
                break;
            }
        };

        if !ctx.relay(SOURCE, C::payload(&message)).await {
            continue;
        }

        if let Err(e) = consumer.ack(&message).await {
            ctx.errors.report(HandleError::new(SOURCE, e));
        }
    }

    if let Err(e) = consumer.close().await {
        tracing::warn!("Failed to close Pulsar consumer: {}", e);
    }
}
