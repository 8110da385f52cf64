//! Kafka telemetry throttle filter.
//!
//! Consumes telemetry event batches from source topics, throttles them per
//! sensor via a keyed time-since-last-seen map, and republishes the batches
//! that carry new-enough readings to derived destination topics.

pub mod api;
pub mod config;
pub mod consumer;
pub mod filter;
pub mod producer;
pub mod state;
pub mod worker;
