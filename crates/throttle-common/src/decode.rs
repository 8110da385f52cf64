//! Payload decoding strategies.
//!
//! The worker does not care how a payload was decoded as long as it ends up
//! as an [`EventBatch`], so the decoder is a capability injected at worker
//! construction. Two strategies exist:
//!
//! - `serde`: direct typed deserialization (default).
//! - `collector`: a two-pass `Value` walk mirroring how the upstream
//!   collector normalizes non-conforming firmware output.
//!
//! Both tolerate a bare-string `OriginOfCondition` and both reject payloads
//! without an `Events` array.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{Event, EventBatch, ResourceId};

/// Errors produced while decoding a raw payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no Events array")]
    MissingEvents,

    #[error("Events entry is not an object")]
    MalformedEvent,
}

/// Decodes a raw bus payload into an [`EventBatch`].
pub trait EventDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<EventBatch, DecodeError>;
}

/// Which decode strategy to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// Direct typed deserialization via serde.
    #[default]
    Serde,
    /// Two-pass normalization pass, as the upstream collector does it.
    Collector,
}

impl DecodeStrategy {
    /// All recognized strategy names, for error messages.
    pub const NAMES: &'static [&'static str] = &["serde", "collector"];

    /// Build the decoder for this strategy.
    pub fn decoder(self) -> Arc<dyn EventDecoder> {
        match self {
            DecodeStrategy::Serde => Arc::new(SerdeDecoder),
            DecodeStrategy::Collector => Arc::new(CollectorDecoder),
        }
    }
}

impl fmt::Display for DecodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeStrategy::Serde => f.write_str("serde"),
            DecodeStrategy::Collector => f.write_str("collector"),
        }
    }
}

impl FromStr for DecodeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serde" => Ok(DecodeStrategy::Serde),
            "collector" => Ok(DecodeStrategy::Collector),
            other => Err(format!(
                "unknown decode strategy {:?} (expected one of: {})",
                other,
                Self::NAMES.join(", ")
            )),
        }
    }
}

/// Direct typed deserialization. `EventBatch::events` has no default, so a
/// payload without an `Events` key fails here.
struct SerdeDecoder;

impl EventDecoder for SerdeDecoder {
    fn decode(&self, payload: &[u8]) -> Result<EventBatch, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Two-pass decode: parse the batch header with the events pulled out, then
/// normalize each event object individually. A bare-string
/// `OriginOfCondition` is rewrapped before the typed parse so the rest of
/// the event still goes through serde.
struct CollectorDecoder;

impl EventDecoder for CollectorDecoder {
    fn decode(&self, payload: &[u8]) -> Result<EventBatch, DecodeError> {
        let mut obj: Map<String, Value> = serde_json::from_slice(payload)?;

        let entries = match obj.remove("Events") {
            Some(Value::Array(entries)) => entries,
            Some(_) => return Err(DecodeError::MalformedEvent),
            None => return Err(DecodeError::MissingEvents),
        };

        obj.insert("Events".to_string(), Value::Array(Vec::new()));
        let mut batch: EventBatch = serde_json::from_value(Value::Object(obj))?;

        for entry in entries {
            let Value::Object(mut fields) = entry else {
                return Err(DecodeError::MalformedEvent);
            };

            let origin = match fields.remove("OriginOfCondition") {
                Some(Value::String(oid)) => Some(ResourceId::new(oid)),
                Some(other) => {
                    fields.insert("OriginOfCondition".to_string(), other);
                    None
                }
                None => None,
            };

            let mut event: Event = serde_json::from_value(Value::Object(fields))?;
            if origin.is_some() {
                event.origin_of_condition = origin;
            }
            batch.events.push(event);
        }

        Ok(batch)
    }
}
