//! Shared counters and broker health.
//!
//! Counters live on the hot path and are plain atomics; the HTTP surface
//! reads them through read-only snapshot structs. Broker health is a small
//! record behind a lock, written only by the owning component's loop and
//! read by the health endpoints (stale reads are fine).

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::info;

/// How often each component logs its counters.
pub const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(5);

const RATE_SLOT_MS: u64 = 250;
// Slots covering the 1s window, plus one being recycled.
const RATE_SLOTS: usize = 5;
const RATE_WINDOW_SLOTS: u64 = 4;

/// Sliding 1-second event rate, safe for concurrent increments.
///
/// Counts land in 250 ms buckets stamped with their slot tick; reads sum
/// the buckets still inside the window. Slightly approximate under
/// concurrent slot turnover, which is fine for an observability rate.
#[derive(Debug)]
pub struct RateCounter {
    epoch: Instant,
    buckets: [AtomicU64; RATE_SLOTS],
    stamps: [AtomicU64; RATE_SLOTS],
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            buckets: Default::default(),
            stamps: Default::default(),
        }
    }

    fn tick(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64) / RATE_SLOT_MS
    }

    pub fn incr(&self) {
        let tick = self.tick();
        let slot = (tick % RATE_SLOTS as u64) as usize;
        if self.stamps[slot].swap(tick, Ordering::AcqRel) != tick {
            self.buckets[slot].store(0, Ordering::Release);
        }
        self.buckets[slot].fetch_add(1, Ordering::AcqRel);
    }

    /// Events counted over the last second.
    pub fn rate(&self) -> u64 {
        let tick = self.tick();
        let mut total = 0;
        for slot in 0..RATE_SLOTS {
            let stamp = self.stamps[slot].load(Ordering::Acquire);
            if tick.saturating_sub(stamp) < RATE_WINDOW_SLOTS {
                total += self.buckets[slot].load(Ordering::Acquire);
            }
        }
        total
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by the consumer loop.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub consumed_messages: AtomicU64,
    pub malformed_consumed_messages: AtomicU64,
    pub overall_consumer_lag: AtomicI32,
    pub messages_per_second: RateCounter,
}

/// Read-only view for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerMetricsSnapshot {
    #[serde(rename = "ConsumedMessages")]
    pub consumed_messages: u64,
    #[serde(rename = "MalformedConsumedMessages")]
    pub malformed_consumed_messages: u64,
    #[serde(rename = "OverallKafkaConsumerLag")]
    pub overall_consumer_lag: i32,
    #[serde(rename = "InstantKafkaMessagesPerSecond")]
    pub messages_per_second: u64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            consumed_messages: self.consumed_messages.load(Ordering::Relaxed),
            malformed_consumed_messages: self.malformed_consumed_messages.load(Ordering::Relaxed),
            overall_consumer_lag: self.overall_consumer_lag.load(Ordering::Relaxed),
            messages_per_second: self.messages_per_second.rate(),
        }
    }
}

/// Counters owned by one worker.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub received_messages: AtomicU64,
    pub sent_messages: AtomicU64,
    pub throttled_messages: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub messages_per_second: RateCounter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerMetricsSnapshot {
    #[serde(rename = "ReceivedMessages")]
    pub received_messages: u64,
    #[serde(rename = "SentMessages")]
    pub sent_messages: u64,
    #[serde(rename = "ThrottledMessages")]
    pub throttled_messages: u64,
    #[serde(rename = "MalformedMessages")]
    pub malformed_messages: u64,
    #[serde(rename = "InstantMessagesPerSecond")]
    pub messages_per_second: u64,
}

impl WorkerMetrics {
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            received_messages: self.received_messages.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            throttled_messages: self.throttled_messages.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            messages_per_second: self.messages_per_second.rate(),
        }
    }

    /// Sum of all workers' counters, for the aggregate health view.
    pub fn aggregate(workers: &[Arc<WorkerMetrics>]) -> WorkerMetricsSnapshot {
        let mut total = WorkerMetricsSnapshot::default();
        for worker in workers {
            let snap = worker.snapshot();
            total.received_messages += snap.received_messages;
            total.sent_messages += snap.sent_messages;
            total.throttled_messages += snap.throttled_messages;
            total.malformed_messages += snap.malformed_messages;
            total.messages_per_second += snap.messages_per_second;
        }
        total
    }
}

/// Counters owned by the producer and its delivery loop.
#[derive(Debug, Default)]
pub struct ProducerMetrics {
    pub produced_messages: AtomicU64,
    pub failed_to_produce_messages: AtomicU64,
    pub failed_deliveries: AtomicU64,
    pub messages_per_second: RateCounter,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerMetricsSnapshot {
    #[serde(rename = "ProducedMessages")]
    pub produced_messages: u64,
    #[serde(rename = "FailedToProduceMessages")]
    pub failed_to_produce_messages: u64,
    #[serde(rename = "FailedDeliveries")]
    pub failed_deliveries: u64,
    #[serde(rename = "InstantKafkaMessagesPerSecond")]
    pub messages_per_second: u64,
}

impl ProducerMetrics {
    pub fn snapshot(&self) -> ProducerMetricsSnapshot {
        ProducerMetricsSnapshot {
            produced_messages: self.produced_messages.load(Ordering::Relaxed),
            failed_to_produce_messages: self.failed_to_produce_messages.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            messages_per_second: self.messages_per_second.rate(),
        }
    }
}

/// Liveness of a bus endpoint as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrokerHealthStatus {
    Unknown,
    Closed,
    Error,
    Ok,
}

/// Health record exposed on the health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    #[serde(rename = "Status")]
    pub status: BrokerHealthStatus,
    #[serde(rename = "LastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "LastErrorCode", skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
}

/// Shared handle: written by the owning component, read by the HTTP surface.
///
/// `Closed` is terminal; every other transition is last-writer-wins.
#[derive(Debug, Clone)]
pub struct SharedBrokerHealth(Arc<RwLock<BrokerHealth>>);

impl SharedBrokerHealth {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(BrokerHealth {
            status: BrokerHealthStatus::Unknown,
            last_error: None,
            last_error_code: None,
        })))
    }

    pub fn status(&self) -> BrokerHealthStatus {
        self.0.read().status
    }

    pub fn snapshot(&self) -> BrokerHealth {
        self.0.read().clone()
    }

    /// Successful bus activity: go to `Ok` and clear the recorded error.
    pub fn mark_ok(&self) {
        let mut health = self.0.write();
        if health.status == BrokerHealthStatus::Closed {
            return;
        }
        health.status = BrokerHealthStatus::Ok;
        health.last_error = None;
        health.last_error_code = None;
    }

    pub fn mark_error(&self, code: impl Into<String>, error: impl Into<String>) {
        let mut health = self.0.write();
        if health.status == BrokerHealthStatus::Closed {
            return;
        }
        health.status = BrokerHealthStatus::Error;
        health.last_error = Some(error.into());
        health.last_error_code = Some(code.into());
    }

    pub fn mark_closed(&self) {
        self.0.write().status = BrokerHealthStatus::Closed;
    }

    /// Statistics arrival implies connectivity even when no messages flow.
    pub fn promote_unknown_to_ok(&self) {
        let mut health = self.0.write();
        if health.status == BrokerHealthStatus::Unknown {
            health.status = BrokerHealthStatus::Ok;
        }
    }
}

impl Default for SharedBrokerHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically logs a component's counters until its shutdown fires.
pub fn spawn_metrics_logger<S, F>(component: String, mut shutdown: broadcast::Receiver<()>, snapshot: F)
where
    F: Fn() -> S + Send + 'static,
    S: std::fmt::Debug,
{
    tokio::spawn(async move {
        let mut ticker = interval(METRICS_LOG_INTERVAL);
        ticker.tick().await; // first tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(component = %component, "metrics loop is done");
                    return;
                }
                _ = ticker.tick() => {
                    info!(component = %component, metrics = ?snapshot(), "metrics");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_counts_recent_increments() {
        let counter = RateCounter::new();
        assert_eq!(counter.rate(), 0);
        for _ in 0..5 {
            counter.incr();
        }
        assert_eq!(counter.rate(), 5);
    }

    #[test]
    fn health_starts_unknown_and_promotes() {
        let health = SharedBrokerHealth::new();
        assert_eq!(health.status(), BrokerHealthStatus::Unknown);

        health.promote_unknown_to_ok();
        assert_eq!(health.status(), BrokerHealthStatus::Ok);

        // Promotion only applies to Unknown.
        health.mark_error("ERR", "broker down");
        health.promote_unknown_to_ok();
        assert_eq!(health.status(), BrokerHealthStatus::Error);
    }

    #[test]
    fn health_ok_clears_error_details() {
        let health = SharedBrokerHealth::new();
        health.mark_error("_TRANSPORT", "all brokers down");

        let snap = health.snapshot();
        assert_eq!(snap.status, BrokerHealthStatus::Error);
        assert_eq!(snap.last_error_code.as_deref(), Some("_TRANSPORT"));

        health.mark_ok();
        let snap = health.snapshot();
        assert_eq!(snap.status, BrokerHealthStatus::Ok);
        assert!(snap.last_error.is_none());
        assert!(snap.last_error_code.is_none());
    }

    #[test]
    fn closed_is_terminal() {
        let health = SharedBrokerHealth::new();
        health.mark_closed();
        health.mark_ok();
        health.mark_error("E", "e");
        health.promote_unknown_to_ok();
        assert_eq!(health.status(), BrokerHealthStatus::Closed);
    }

    #[test]
    fn worker_aggregate_sums_counters() {
        let a = Arc::new(WorkerMetrics::default());
        let b = Arc::new(WorkerMetrics::default());
        a.received_messages.store(3, Ordering::Relaxed);
        a.sent_messages.store(2, Ordering::Relaxed);
        b.received_messages.store(4, Ordering::Relaxed);
        b.throttled_messages.store(1, Ordering::Relaxed);
        b.malformed_messages.store(1, Ordering::Relaxed);

        let total = WorkerMetrics::aggregate(&[a, b]);
        assert_eq!(total.received_messages, 7);
        assert_eq!(total.sent_messages, 2);
        assert_eq!(total.throttled_messages, 1);
        assert_eq!(total.malformed_messages, 1);
    }

    #[test]
    fn snapshot_field_names_match_wire_format() {
        let metrics = ConsumerMetrics::default();
        metrics.consumed_messages.store(9, Ordering::Relaxed);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["ConsumedMessages"], 9);
        assert!(json.get("OverallKafkaConsumerLag").is_some());
    }
}
