//! Event workers.
//!
//! Each worker owns one inbound queue, one `TopicFilter` per configured
//! source topic, and a handle to the shared producer. Work units are
//! processed strictly in arrival order; the filter state never leaves the
//! worker, so no synchronization is needed around it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use throttle_common::EventDecoder;

use crate::config::BrokerConfig;
use crate::filter::TopicFilter;
use crate::producer::MessagePublisher;
use crate::state::WorkerMetrics;

/// The unit of work crossing consumer → worker: raw bytes plus routing
/// metadata. Never mutated after enqueue; the forwarded payload is these
/// exact bytes.
#[derive(Debug, Clone)]
pub struct UnparsedEventPayload {
    pub message_key: Vec<u8>,
    pub topic: String,
    pub payload_raw: Vec<u8>,
}

pub struct Worker {
    id: usize,
    metrics: Arc<WorkerMetrics>,
    decoder: Arc<dyn EventDecoder>,
    publisher: Arc<dyn MessagePublisher>,
    // Both maps are fixed at startup; one entry per configured source topic.
    filters: HashMap<String, TopicFilter>,
    destinations: HashMap<String, String>,
    work_queue: mpsc::Receiver<UnparsedEventPayload>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: &BrokerConfig,
        decoder: Arc<dyn EventDecoder>,
        publisher: Arc<dyn MessagePublisher>,
        work_queue: mpsc::Receiver<UnparsedEventPayload>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        let mut filters = HashMap::new();
        let mut destinations = HashMap::new();
        for (topic, filter_config) in &config.topics_to_filter {
            filters.insert(
                topic.clone(),
                TopicFilter::new(Duration::from_secs(u64::from(
                    filter_config.throttle_period_seconds,
                ))),
            );
            if let Some(destination) = config.destination_topic(topic) {
                destinations.insert(topic.clone(), destination);
            }
        }

        Self {
            id,
            metrics,
            decoder,
            publisher,
            filters,
            destinations,
            work_queue,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker = self.id, "starting worker");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                unit = self.work_queue.recv() => match unit {
                    Some(unit) => self.process(unit),
                    None => break,
                },
            }
        }

        info!(worker = self.id, "worker finished");
    }

    fn process(&mut self, unit: UnparsedEventPayload) {
        debug!(
            worker = self.id,
            message_key = ?unit.message_key,
            topic = %unit.topic,
            "received work unit"
        );
        self.metrics.messages_per_second.incr();
        self.metrics.received_messages.fetch_add(1, Ordering::Relaxed);

        let batch = match self.decoder.decode(&unit.payload_raw) {
            Ok(batch) => batch,
            Err(err) => {
                error!(worker = self.id, topic = %unit.topic, %err, "failed to decode payload");
                self.metrics.malformed_messages.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // A unit for an un-configured topic means the subscription and the
        // filter set disagree. Count it, never crash.
        let Some(filter) = self.filters.get_mut(&unit.topic) else {
            error!(worker = self.id, topic = %unit.topic, "no topic filter for topic");
            self.metrics.malformed_messages.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if filter.should_throttle(&batch) {
            debug!(worker = self.id, topic = %unit.topic, "throttling message");
            self.metrics.throttled_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }

        debug!(worker = self.id, topic = %unit.topic, "sending message");
        self.metrics.sent_messages.fetch_add(1, Ordering::Relaxed);

        let Some(destination) = self.destinations.get(&unit.topic) else {
            error!(worker = self.id, topic = %unit.topic, "no destination topic for topic");
            return;
        };

        // Forward the original raw bytes; the decoded batch existed only
        // for the throttle decision. A submit failure is dropped here, the
        // producer's delivery loop accounts for asynchronous failures.
        if let Err(err) = self.publisher.publish(destination, &unit.payload_raw) {
            error!(worker = self.id, %err, "failed to produce message");
        }
    }
}
