//! Kafka producer shared by all workers.
//!
//! `publish` only surfaces the synchronous submit error; each submit hands
//! back a delivery future that a single drain task awaits, which is where
//! asynchronous delivery results update health and counters.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer as _};
use rdkafka::Message as _;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::config::BrokerConfig;
use crate::state::{ProducerMetrics, SharedBrokerHealth};

/// Failure to hand a message to the producer queue. Delivery failures are
/// asynchronous and surface in the delivery loop instead.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to queue message for topic {topic}: {source}")]
    Submit {
        topic: String,
        #[source]
        source: KafkaError,
    },
}

/// Thread-safe publish capability handed to workers.
pub trait MessagePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Routes client-level producer errors into broker health.
struct ProducerHealthContext {
    health: SharedBrokerHealth,
}

impl ClientContext for ProducerHealthContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let code = error
            .rdkafka_error_code()
            .map(|code| format!("{code:?}"))
            .unwrap_or_else(|| "Unknown".to_string());
        error!(%error, %code, reason, "kafka producer error");
        self.health.mark_error(code, reason.to_string());
    }
}

/// One instance per process, shared by all workers.
pub struct KafkaProducer {
    producer: FutureProducer<ProducerHealthContext>,
    metrics: Arc<ProducerMetrics>,
    delivery_tx: mpsc::UnboundedSender<DeliveryFuture>,
}

impl KafkaProducer {
    /// Create the producer handle. Returns the receiving end of the
    /// delivery-future channel for [`run_delivery_loop`].
    pub fn new(
        config: &BrokerConfig,
        metrics: Arc<ProducerMetrics>,
        health: SharedBrokerHealth,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveryFuture>)> {
        info!(broker_address = %config.broker_address, "initializing producer");

        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker_address)
            .create_with_context(ProducerHealthContext {
                health: health.clone(),
            })
            .context("failed to create Kafka producer")?;

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                producer,
                metrics,
                delivery_tx,
            },
            delivery_rx,
        ))
    }

    /// Block until queued messages are delivered or the timeout passes.
    pub fn flush(&self, timeout: Duration) {
        if let Err(err) = self.producer.flush(timeout) {
            error!(%err, "failed to flush producer before shutdown");
        }
    }
}

impl MessagePublisher for KafkaProducer {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::<(), _>::to(topic).payload(payload);

        match self.producer.send_result(record) {
            Ok(delivery) => {
                self.metrics.produced_messages.fetch_add(1, Ordering::Relaxed);
                self.metrics.messages_per_second.incr();
                // The drain task only goes away at shutdown; a send failure
                // here just means the delivery result is no longer wanted.
                let _ = self.delivery_tx.send(delivery);
                Ok(())
            }
            Err((source, _record)) => {
                self.metrics
                    .failed_to_produce_messages
                    .fetch_add(1, Ordering::Relaxed);
                Err(PublishError::Submit {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }
}

/// Drains delivery results until the producer handle is dropped.
///
/// Successful deliveries move health to `Ok`; per-message delivery errors
/// are counted and logged but deliberately leave health alone.
pub async fn run_delivery_loop(
    mut deliveries: mpsc::UnboundedReceiver<DeliveryFuture>,
    metrics: Arc<ProducerMetrics>,
    health: SharedBrokerHealth,
) {
    while let Some(delivery) = deliveries.recv().await {
        match delivery.await {
            Ok(Ok((partition, offset))) => {
                trace!(partition, offset, "produced message");
                health.mark_ok();
            }
            Ok(Err((err, message))) => {
                metrics.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                error!(%err, topic = message.topic(), "failed to deliver message");
            }
            Err(_) => {
                debug!("delivery notification dropped before completion");
            }
        }
    }
    info!("producer delivery loop finished");
}
