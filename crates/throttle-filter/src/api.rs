//! HTTP introspection endpoints.
//!
//! - `GET /liveness` — 204 while the process runs
//! - `GET /readiness` — 204 unless consumer or producer health is `Error`
//! - `GET /health` — consumer, worker-aggregate, and producer metrics/health
//! - `GET /health/workers` — per-worker metrics keyed by worker id
//! - `GET /metrics` — Prometheus text exposition

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::state::{
    BrokerHealth, BrokerHealthStatus, ConsumerMetrics, ConsumerMetricsSnapshot, ProducerMetrics,
    ProducerMetricsSnapshot, SharedBrokerHealth, WorkerMetrics, WorkerMetricsSnapshot,
};

/// Prometheus registry plus the gauges scraped at `/metrics`.
///
/// Gauge values are refreshed from the atomic counters at scrape time, so
/// the exposition and `/health` always agree.
pub struct PromMetrics {
    registry: Registry,
    consumed_messages: IntGaugeVec,
    malformed_consumed_messages: IntGaugeVec,
    overall_consumer_lag: IntGaugeVec,
    messages_consumed_per_second: IntGaugeVec,
    produced_messages: IntGaugeVec,
    failed_to_produce_messages: IntGaugeVec,
    messages_produced_per_second: IntGaugeVec,
}

impl PromMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let consumer_gauge = |name: &str, help: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["ConsumerID"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let producer_gauge = |name: &str, help: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["ProducerID"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            consumed_messages: consumer_gauge(
                "ConsumedMessages",
                "The number of messages consumed from the source topics by the filter",
            )?,
            malformed_consumed_messages: consumer_gauge(
                "MalformedConsumedMessages",
                "The number of malformed messages consumed and discarded by the filter",
            )?,
            overall_consumer_lag: consumer_gauge(
                "OverallKafkaConsumerLag",
                "The overall lag across all topics for the filter",
            )?,
            messages_consumed_per_second: consumer_gauge(
                "MessagesConsumedPerSecond",
                "The rate of messages consumed by the filter per second",
            )?,
            produced_messages: producer_gauge(
                "ProducedMessages",
                "The number of messages produced to the filtered topics by the filter",
            )?,
            failed_to_produce_messages: producer_gauge(
                "FailedToProduceMessages",
                "The total number of messages that the filter failed to produce",
            )?,
            messages_produced_per_second: producer_gauge(
                "MessagesProducedPerSecond",
                "The rate of messages produced to the filtered topics per second",
            )?,
            registry,
        })
    }

    fn refresh(&self, consumer: &ConsumerMetricsSnapshot, producer: &ProducerMetricsSnapshot) {
        let consumer_id = &["0"];
        self.consumed_messages
            .with_label_values(consumer_id)
            .set(consumer.consumed_messages as i64);
        self.malformed_consumed_messages
            .with_label_values(consumer_id)
            .set(consumer.malformed_consumed_messages as i64);
        self.overall_consumer_lag
            .with_label_values(consumer_id)
            .set(i64::from(consumer.overall_consumer_lag));
        self.messages_consumed_per_second
            .with_label_values(consumer_id)
            .set(consumer.messages_per_second as i64);

        let producer_id = &["0"];
        self.produced_messages
            .with_label_values(producer_id)
            .set(producer.produced_messages as i64);
        self.failed_to_produce_messages
            .with_label_values(producer_id)
            .set(producer.failed_to_produce_messages as i64);
        self.messages_produced_per_second
            .with_label_values(producer_id)
            .set(producer.messages_per_second as i64);
    }

    fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Read-only handles the HTTP surface needs.
#[derive(Clone)]
pub struct ApiState {
    pub consumer_metrics: Arc<ConsumerMetrics>,
    pub consumer_health: SharedBrokerHealth,
    pub worker_metrics: Vec<Arc<WorkerMetrics>>,
    pub producer_metrics: Arc<ProducerMetrics>,
    pub producer_health: SharedBrokerHealth,
    pub prom: Arc<PromMetrics>,
}

#[derive(Debug, Serialize)]
struct ComponentHealth<M: Serialize> {
    #[serde(rename = "BrokerHealth")]
    broker_health: BrokerHealth,
    #[serde(rename = "Metrics")]
    metrics: M,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    #[serde(rename = "Consumer")]
    consumer: ComponentHealth<ConsumerMetricsSnapshot>,
    #[serde(rename = "WorkerAggregate")]
    worker_aggregate: WorkerMetricsSnapshot,
    #[serde(rename = "Producer")]
    producer: ComponentHealth<ProducerMetricsSnapshot>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/health", get(health))
        .route("/health/workers", get(health_workers))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the introspection API until shutdown fires.
pub async fn serve(
    listen: SocketAddr,
    state: ApiState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen}"))?;
    info!(%listen, "starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("HTTP server failed")
}

async fn liveness() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Not ready while either bus endpoint is in `Error`: incoming data would
/// be dropped, so keep traffic away until the bus client recovers.
async fn readiness(State(state): State<ApiState>) -> StatusCode {
    let ready = state.consumer_health.status() != BrokerHealthStatus::Error
        && state.producer_health.status() != BrokerHealthStatus::Error;

    if ready {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        consumer: ComponentHealth {
            broker_health: state.consumer_health.snapshot(),
            metrics: state.consumer_metrics.snapshot(),
        },
        worker_aggregate: WorkerMetrics::aggregate(&state.worker_metrics),
        producer: ComponentHealth {
            broker_health: state.producer_health.snapshot(),
            metrics: state.producer_metrics.snapshot(),
        },
    })
}

async fn health_workers(
    State(state): State<ApiState>,
) -> Json<BTreeMap<usize, WorkerMetricsSnapshot>> {
    let workers = state
        .worker_metrics
        .iter()
        .enumerate()
        .map(|(id, metrics)| (id, metrics.snapshot()))
        .collect();
    Json(workers)
}

async fn metrics(State(state): State<ApiState>) -> Result<String, StatusCode> {
    state.prom.refresh(
        &state.consumer_metrics.snapshot(),
        &state.producer_metrics.snapshot(),
    );
    state.prom.encode().map_err(|err| {
        error!(%err, "failed to encode prometheus metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn test_state() -> ApiState {
        ApiState {
            consumer_metrics: Arc::new(ConsumerMetrics::default()),
            consumer_health: SharedBrokerHealth::new(),
            worker_metrics: vec![
                Arc::new(WorkerMetrics::default()),
                Arc::new(WorkerMetrics::default()),
            ],
            producer_metrics: Arc::new(ProducerMetrics::default()),
            producer_health: SharedBrokerHealth::new(),
            prom: Arc::new(PromMetrics::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn liveness_is_no_content() {
        assert_eq!(liveness().await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn readiness_follows_broker_health() {
        let state = test_state();
        assert_eq!(readiness(State(state.clone())).await, StatusCode::NO_CONTENT);

        state.producer_health.mark_error("_TRANSPORT", "down");
        assert_eq!(
            readiness(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.producer_health.mark_ok();
        assert_eq!(readiness(State(state.clone())).await, StatusCode::NO_CONTENT);

        // Unknown and Closed are not failures; only Error flips readiness.
        state.consumer_health.mark_closed();
        assert_eq!(readiness(State(state)).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn health_aggregates_workers() {
        let state = test_state();
        state.worker_metrics[0]
            .sent_messages
            .store(2, Ordering::Relaxed);
        state.worker_metrics[1]
            .sent_messages
            .store(3, Ordering::Relaxed);
        state
            .consumer_metrics
            .consumed_messages
            .store(7, Ordering::Relaxed);

        let response = health(State(state)).await;
        let json = serde_json::to_value(&response.0).unwrap();

        assert_eq!(json["WorkerAggregate"]["SentMessages"], 5);
        assert_eq!(json["Consumer"]["Metrics"]["ConsumedMessages"], 7);
        assert_eq!(json["Consumer"]["BrokerHealth"]["Status"], "Unknown");
        assert!(json["Producer"]["BrokerHealth"]
            .get("LastError")
            .is_none());
    }

    #[tokio::test]
    async fn health_workers_keys_by_worker_id() {
        let state = test_state();
        state.worker_metrics[1]
            .throttled_messages
            .store(9, Ordering::Relaxed);

        let response = health_workers(State(state)).await;
        let json = serde_json::to_value(&response.0).unwrap();
        assert_eq!(json["0"]["ThrottledMessages"], 0);
        assert_eq!(json["1"]["ThrottledMessages"], 9);
    }

    #[tokio::test]
    async fn metrics_exposes_prometheus_text() {
        let state = test_state();
        state
            .consumer_metrics
            .consumed_messages
            .store(42, Ordering::Relaxed);
        state
            .producer_metrics
            .produced_messages
            .store(11, Ordering::Relaxed);

        let body = metrics(State(state)).await.unwrap();
        assert!(body.contains("ConsumedMessages{ConsumerID=\"0\"} 42"));
        assert!(body.contains("ProducedMessages{ProducerID=\"0\"} 11"));
        assert!(body.contains("OverallKafkaConsumerLag"));
    }
}
