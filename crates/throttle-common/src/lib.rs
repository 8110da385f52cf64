//! Shared types and decoders for the telemetry throttle filter.
//!
//! This crate contains:
//! - The Redfish-like event wire model (EventBatch, Event, SensorReading)
//! - The `EventDecoder` capability and its decode strategies

pub mod decode;
pub mod types;

pub use decode::{DecodeError, DecodeStrategy, EventDecoder};
pub use types::*;
