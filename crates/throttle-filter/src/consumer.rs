//! Kafka consumer: the single poll loop feeding the workers.
//!
//! The loop does the least work possible per message: no payload parsing,
//! just routing raw bytes to a worker by message key. Decoding happens on
//! the worker side, off this thread. Statistics and committed-offset
//! callbacks arrive through the client context.

use std::env;
use std::hash::Hasher;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::statistics::Statistics;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Message as _, TopicPartitionList};
use siphasher::sip::SipHasher13;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::state::{ConsumerMetrics, SharedBrokerHealth};
use crate::worker::UnparsedEventPayload;

/// Fallback client id component when the environment has no hostname.
const DEFAULT_HOSTNAME: &str = "telemetry-filter";

/// Deterministic message-key → worker routing.
///
/// The keys are drawn once at construction, so the mapping is stable for
/// the lifetime of the process: equal key bytes always land on the same
/// worker.
pub struct WorkerRouter {
    key0: u64,
    key1: u64,
    worker_count: usize,
}

impl WorkerRouter {
    pub fn new(worker_count: usize) -> Self {
        Self {
            key0: rand::random(),
            key1: rand::random(),
            worker_count,
        }
    }

    pub fn route(&self, message_key: &[u8]) -> usize {
        let mut hasher = SipHasher13::new_with_keys(self.key0, self.key1);
        hasher.write(message_key);
        (hasher.finish() % self.worker_count as u64) as usize
    }
}

/// Sum of `consumer_lag` across every topic/partition entry, as reported
/// by librdkafka (including its `-1` unknown-lag placeholders).
fn overall_consumer_lag(statistics: &Statistics) -> i32 {
    let mut lag: i32 = 0;
    for topic in statistics.topics.values() {
        for partition in topic.partitions.values() {
            lag = lag.wrapping_add(partition.consumer_lag as i32);
        }
    }
    lag
}

/// Client context wiring statistics, committed offsets, and client-level
/// errors into the consumer's metrics and health.
struct FilterConsumerContext {
    metrics: Arc<ConsumerMetrics>,
    health: SharedBrokerHealth,
}

impl ClientContext for FilterConsumerContext {
    fn stats(&self, statistics: Statistics) {
        self.metrics
            .overall_consumer_lag
            .store(overall_consumer_lag(&statistics), Ordering::Relaxed);

        // Statistics arriving means we are connected, even if no messages
        // are flowing yet.
        self.health.promote_unknown_to_ok();
    }

    fn error(&self, error: KafkaError, reason: &str) {
        handle_bus_error(&self.health, &error, reason);
    }
}

impl ConsumerContext for FilterConsumerContext {
    fn commit_callback(&self, result: rdkafka::error::KafkaResult<()>, offsets: &TopicPartitionList) {
        debug!(?result, ?offsets, "offsets committed");
    }
}

fn is_soft_error(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic)
    )
}

fn handle_bus_error(health: &SharedBrokerHealth, error: &KafkaError, reason: &str) {
    let code = error
        .rdkafka_error_code()
        .map(|code| format!("{code:?}"))
        .unwrap_or_else(|| "Unknown".to_string());

    // Unknown topics are a soft error: the topic may simply not exist yet.
    if is_soft_error(error) {
        warn!(%error, %code, reason, "unknown topic");
    } else {
        error!(%error, %code, reason, "kafka consumer error");
        health.mark_error(code, format!("{error}"));
    }
}

pub struct Consumer {
    id: usize,
    inner: StreamConsumer<FilterConsumerContext>,
    metrics: Arc<ConsumerMetrics>,
    health: SharedBrokerHealth,
    router: WorkerRouter,
    work_queues: Vec<mpsc::Sender<UnparsedEventPayload>>,
}

impl Consumer {
    /// Connect to the bus and subscribe to every configured source topic.
    /// Failure here is fatal to startup.
    pub fn new(
        id: usize,
        config: &BrokerConfig,
        session_timeout: Duration,
        work_queues: Vec<mpsc::Sender<UnparsedEventPayload>>,
        metrics: Arc<ConsumerMetrics>,
        health: SharedBrokerHealth,
    ) -> Result<Self> {
        let hostname = env::var("HOSTNAME").unwrap_or_else(|_| DEFAULT_HOSTNAME.to_string());

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.broker_address)
            .set("group.id", &config.consumer_group)
            .set("client.id", format!("{hostname}-id-{id}"))
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("statistics.interval.ms", "1000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest");

        info!(id, broker_address = %config.broker_address, "connecting to kafka");
        let inner: StreamConsumer<FilterConsumerContext> = client_config
            .create_with_context(FilterConsumerContext {
                metrics: metrics.clone(),
                health: health.clone(),
            })
            .context("failed to create Kafka consumer")?;

        let topics = config.source_topics();
        info!(?topics, "subscribing to topics");
        inner
            .subscribe(&topics)
            .context("failed to subscribe to source topics")?;

        Ok(Self {
            id,
            inner,
            metrics,
            health,
            router: WorkerRouter::new(work_queues.len()),
            work_queues,
        })
    }

    /// Poll until shutdown fires. Does not drain: messages already handed
    /// to workers remain theirs, nothing further is polled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(id = self.id, workers = self.work_queues.len(), "starting consumer");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(id = self.id, "closing consumer");
                    break;
                }
                polled = self.inner.recv() => match polled {
                    Ok(message) => self.dispatch(&message).await,
                    Err(err) => handle_bus_error(&self.health, &err, "poll"),
                },
            }
        }

        // Dropping the handle closes the bus consumer.
        self.health.mark_closed();
        info!(id = self.id, "consumer finished");
    }

    async fn dispatch(&self, message: &BorrowedMessage<'_>) {
        self.metrics.messages_per_second.incr();
        self.metrics.consumed_messages.fetch_add(1, Ordering::Relaxed);
        self.health.mark_ok();

        let topic = message.topic();
        if topic.is_empty() {
            warn!("received message without a topic");
            self.metrics
                .malformed_consumed_messages
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        // A key is required to route the message to a worker. Deriving one
        // from the payload would mean parsing JSON on this thread, which is
        // exactly what the worker split exists to avoid.
        let Some(key) = message.key().filter(|key| !key.is_empty()) else {
            warn!(topic, "received message without a key");
            return;
        };

        let worker = self.router.route(key);
        debug!(message_key = ?key, worker, "sending event to worker");

        let unit = UnparsedEventPayload {
            message_key: key.to_vec(),
            topic: topic.to_string(),
            payload_raw: message.payload().unwrap_or_default().to_vec(),
        };

        // Blocking send: when the worker's queue is full this stalls the
        // poll loop, letting the bus's own flow control throttle upstream.
        if self.work_queues[worker].send(unit).await.is_err() {
            error!(worker, "worker queue closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::statistics::{Partition, Topic};

    #[test]
    fn routing_is_stable_for_equal_keys() {
        let router = WorkerRouter::new(10);
        let key = b"x9000c1s0b0n0";
        let first = router.route(key);
        for _ in 0..100 {
            assert_eq!(router.route(key), first);
        }
        assert_eq!(router.route(&key.to_vec()), first);
    }

    #[test]
    fn routing_stays_in_bounds_and_spreads() {
        let router = WorkerRouter::new(4);
        let mut hit = [false; 4];
        for i in 0..1000 {
            let key = format!("node-{i}");
            let worker = router.route(key.as_bytes());
            assert!(worker < 4);
            hit[worker] = true;
        }
        assert!(hit.iter().all(|&h| h), "uniform hash should reach every worker");
    }

    #[test]
    fn single_worker_routes_everything_to_zero() {
        let router = WorkerRouter::new(1);
        for i in 0..50 {
            assert_eq!(router.route(format!("k{i}").as_bytes()), 0);
        }
    }

    #[test]
    fn lag_sums_across_topics_and_partitions() {
        let mut statistics = Statistics::default();

        let mut temperature = Topic::default();
        let mut p0 = Partition::default();
        p0.consumer_lag = 3;
        let mut p1 = Partition::default();
        p1.consumer_lag = 4;
        temperature.partitions.insert(0, p0);
        temperature.partitions.insert(1, p1);

        let mut voltage = Topic::default();
        let mut p2 = Partition::default();
        p2.consumer_lag = -1; // librdkafka's unknown-lag placeholder
        voltage.partitions.insert(0, p2);

        statistics.topics.insert("temperature".to_string(), temperature);
        statistics.topics.insert("voltage".to_string(), voltage);

        assert_eq!(overall_consumer_lag(&statistics), 6);
    }

    #[test]
    fn lag_is_zero_without_statistics() {
        assert_eq!(overall_consumer_lag(&Statistics::default()), 0);
    }
}
