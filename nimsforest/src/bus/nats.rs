//! NATS-backed bus client: core NATS for the ephemeral bus, JetStream for
//! the durable log.

use crate::bus::{Bus, BusError, LeafListener, Subscription};
use crate::Leaf;
use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy},
};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SOURCE_HEADER: &str = "Nims-Source";
const TIMESTAMP_HEADER: &str = "Nims-Timestamp";

#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    /// Broker URL, e.g. `nats://localhost:4222`.
    pub url: String,
    /// JetStream stream backing the durable log.
    pub log_stream: String,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            log_stream: "river".to_string(),
        }
    }
}

/// Shared broker connection. Thread-safe for publish and for subscription
/// creation; every component of the process holds the same instance.
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    log_stream: String,
}

impl NatsBus {
    pub async fn connect(config: NatsBusConfig) -> Result<Self, BusError> {
        info!(url = %config.url, "connecting to NATS");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|err| BusError::Connect(err.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            log_stream: config.log_stream,
        })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, leaf: Leaf) -> Result<(), BusError> {
        let mut headers = HeaderMap::new();
        headers.insert(SOURCE_HEADER, leaf.source.clone());
        headers.insert(TIMESTAMP_HEADER, leaf.timestamp.to_rfc3339());
        // Message id lets the broker's duplicate window suppress redelivered
        // publishes; handlers still tolerate duplicates.
        headers.insert("Nats-Msg-Id", uuid::Uuid::new_v4().to_string());

        self.client
            .publish_with_headers(leaf.subject.clone(), headers, leaf.data)
            .await
            .map_err(|err| BusError::Publish {
                subject: leaf.subject,
                reason: err.to_string(),
            })
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<Arc<dyn Subscription>, BusError> {
        let mut subscriber =
            self.client
                .subscribe(pattern.to_string())
                .await
                .map_err(|err| BusError::Subscribe {
                    pattern: pattern.to_string(),
                    reason: err.to_string(),
                })?;

        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel::<()>();
        let pattern_owned = pattern.to_string();

        // One dispatch task per subscription keeps delivery serial within the
        // subscription while subscriptions stay concurrent with each other.
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_receiver => {
                        if let Err(err) = subscriber.unsubscribe().await {
                            warn!(pattern = %pattern_owned, err = %err, "unsubscribe failed");
                        }
                        break;
                    }
                    delivery = subscriber.next() => {
                        let Some(message) = delivery else {
                            debug!(pattern = %pattern_owned, "subscription closed by server");
                            break;
                        };
                        let leaf = leaf_from_parts(
                            message.subject.to_string(),
                            message.payload,
                            message.headers.as_ref(),
                        );
                        listener.on_receive(leaf).await;
                    }
                }
            }
        });

        Ok(Arc::new(DispatchTaskSubscription::new(shutdown_sender, task)))
    }

    async fn observe(
        &self,
        pattern: &str,
        consumer: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<Arc<dyn Subscription>, BusError> {
        let observe_error = |reason: String| BusError::Observe {
            pattern: pattern.to_string(),
            consumer: consumer.to_string(),
            reason,
        };

        let stream = self
            .jetstream
            .get_stream(self.log_stream.clone())
            .await
            .map_err(|err| observe_error(err.to_string()))?;

        // A durable consumer resumes at its last acknowledged sequence when
        // the same name reattaches after a restart.
        let durable = stream
            .get_or_create_consumer(
                consumer,
                PullConsumerConfig {
                    durable_name: Some(consumer.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: pattern.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| observe_error(err.to_string()))?;

        let mut messages = durable
            .messages()
            .await
            .map_err(|err| observe_error(err.to_string()))?;

        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel::<()>();
        let pattern_owned = pattern.to_string();
        let consumer_owned = consumer.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_receiver => break,
                    delivery = messages.next() => {
                        let message = match delivery {
                            Some(Ok(message)) => message,
                            Some(Err(err)) => {
                                warn!(
                                    pattern = %pattern_owned,
                                    consumer = %consumer_owned,
                                    err = %err,
                                    "durable pull failed"
                                );
                                continue;
                            }
                            None => {
                                debug!(consumer = %consumer_owned, "durable consumer stream ended");
                                break;
                            }
                        };

                        let leaf = leaf_from_parts(
                            message.subject.to_string(),
                            message.payload.clone(),
                            message.headers.as_ref(),
                        );
                        listener.on_receive(leaf).await;

                        // Handler return is the acknowledgement.
                        if let Err(err) = message.ack().await {
                            warn!(consumer = %consumer_owned, err = %err, "ack failed");
                        }
                    }
                }
            }
        });

        Ok(Arc::new(DispatchTaskSubscription::new(shutdown_sender, task)))
    }
}

/// Subscription handle backed by the per-subscription dispatch task.
struct DispatchTaskSubscription {
    shutdown: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl DispatchTaskSubscription {
    fn new(shutdown_sender: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Mutex::new(Some((shutdown_sender, task))),
        }
    }
}

#[async_trait]
impl Subscription for DispatchTaskSubscription {
    async fn unsubscribe(&self) -> Result<(), BusError> {
        // Waits for the dispatch task so no handler runs after this returns.
        if let Some((shutdown_sender, task)) = self.shutdown.lock().await.take() {
            let _ = shutdown_sender.send(());
            let _ = task.await;
        }
        Ok(())
    }
}

fn leaf_from_parts(subject: String, payload: Bytes, headers: Option<&HeaderMap>) -> Leaf {
    let source = headers
        .and_then(|headers| headers.get(SOURCE_HEADER))
        .map(|value| value.as_str().to_string())
        .unwrap_or_default();
    let timestamp = headers
        .and_then(|headers| headers.get(TIMESTAMP_HEADER))
        .and_then(|value| DateTime::parse_from_rfc3339(value.as_str()).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Leaf {
        subject,
        data: payload,
        source,
        timestamp,
    }
}
