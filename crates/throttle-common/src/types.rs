//! Wire model for Redfish-style telemetry event batches.
//!
//! Field names follow the upstream JSON shape exactly. Some BMC firmware
//! emits `OriginOfCondition` as a bare string instead of a resource object,
//! so `ResourceId` accepts both forms and normalizes to the object form.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// Reference to a Redfish resource, e.g. `{"@odata.id": "/redfish/v1/..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceId {
    #[serde(rename = "@odata.id")]
    pub oid: String,
}

impl ResourceId {
    pub fn new(oid: impl Into<String>) -> Self {
        Self { oid: oid.into() }
    }
}

// Accepts either the structured `{"@odata.id": "..."}` form or a bare
// string carrying the identifier directly.
impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ResourceIdVisitor;

        impl<'de> Visitor<'de> for ResourceIdVisitor {
            type Value = ResourceId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a resource object or an @odata.id string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(ResourceId::new(value))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut oid = String::new();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "@odata.id" {
                        oid = map.next_value()?;
                    } else {
                        map.next_value::<de::IgnoredAny>()?;
                    }
                }
                Ok(ResourceId { oid })
            }
        }

        deserializer.deserialize_any(ResourceIdVisitor)
    }
}

/// A single sensor reading carried inside an event's OEM payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SensorReading {
    /// RFC 3339 timestamp of the reading, as emitted by the BMC.
    pub timestamp: String,
    pub location: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parental_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parental_index: Option<u8>,
    pub physical_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u8>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub physical_sub_context: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_specific_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_index: Option<u8>,
    pub value: String,
}

/// OEM sensor group: the telemetry source plus its readings, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SensorGroup {
    pub sensors: Vec<SensorReading>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub telemetry_source: String,
}

/// A single event within a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Event {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_timestamp: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub message_args: Vec<String>,
    /// Batch correlator on older firmware; newer firmware sets it on the batch.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_of_condition: Option<ResourceId>,
    /// Sensor readings; present only on telemetry events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oem: Option<SensorGroup>,
}

/// One bus message's decoded content: batch header plus its events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(rename = "@odata.context", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub odata_context: String,
    #[serde(rename = "@odata.id", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub oid: String,
    #[serde(rename = "@odata.type", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub otype: String,
    #[serde(rename = "Id", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "Name", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Batch-level correlator.
    #[serde(rename = "Context", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(rename = "Description", default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "Events")]
    pub events: Vec<Event>,
    #[serde(rename = "Events@odata.count", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_count: Option<i64>,
}

impl EventBatch {
    /// Iterate every `(event, reading)` pair in batch order.
    pub fn readings(&self) -> impl Iterator<Item = (&Event, &SensorReading)> {
        self.events.iter().flat_map(|event| {
            event
                .oem
                .iter()
                .flat_map(|group| group.sensors.iter())
                .map(move |sensor| (event, sensor))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_from_object() {
        let id: ResourceId =
            serde_json::from_str(r#"{"@odata.id": "/redfish/v1/Chassis/1"}"#).unwrap();
        assert_eq!(id.oid, "/redfish/v1/Chassis/1");
    }

    #[test]
    fn resource_id_from_bare_string() {
        let id: ResourceId = serde_json::from_str(r#""/redfish/v1/Chassis/1""#).unwrap();
        assert_eq!(id.oid, "/redfish/v1/Chassis/1");
    }

    #[test]
    fn resource_id_ignores_extra_fields() {
        let id: ResourceId =
            serde_json::from_str(r##"{"@odata.id": "/x", "@odata.type": "#Chassis"}"##).unwrap();
        assert_eq!(id.oid, "/x");
    }

    #[test]
    fn readings_iterates_in_batch_order() {
        let batch = EventBatch {
            context: "c1".into(),
            events: vec![
                Event {
                    oem: Some(SensorGroup {
                        sensors: vec![
                            SensorReading {
                                location: "a".into(),
                                ..Default::default()
                            },
                            SensorReading {
                                location: "b".into(),
                                ..Default::default()
                            },
                        ],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Event::default(),
                Event {
                    oem: Some(SensorGroup {
                        sensors: vec![SensorReading {
                            location: "c".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let order: Vec<&str> = batch.readings().map(|(_, s)| s.location.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
