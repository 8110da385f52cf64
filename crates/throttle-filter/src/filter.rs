//! Per-topic throttle filter.
//!
//! Tracks, per sensor, the timestamp of the last reading that was allowed
//! through, and decides whether an incoming batch carries anything new
//! enough to forward. Batches are all-or-nothing: if any single reading is
//! due, the whole batch goes out and every reading's bookkeeping is
//! refreshed so the next batch is judged against this one.

use std::collections::HashMap;
use std::hash::Hasher;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, FixedOffset};
use siphasher::sip::SipHasher13;
use tracing::{debug, warn};

use throttle_common::{EventBatch, SensorReading};

/// Slack subtracted from the throttle window to absorb scheduling jitter in
/// the source: a reading arriving up to this much early still counts as due.
const THROTTLE_JITTER_MS: i64 = 100;

/// Decides whether batches from one source topic should be throttled.
///
/// Owned exclusively by one worker; never shared.
pub struct TopicFilter {
    throttle_period: Duration,
    sensor_times: HashMap<u64, DateTime<FixedOffset>>,
    // Hash keys fixed for the lifetime of the filter, never exposed.
    key0: u64,
    key1: u64,
}

impl TopicFilter {
    pub fn new(throttle_period: StdDuration) -> Self {
        Self {
            throttle_period: Duration::seconds(throttle_period.as_secs() as i64),
            sensor_times: HashMap::new(),
            key0: rand::random(),
            key1: rand::random(),
        }
    }

    /// Returns `true` when the batch should be dropped.
    ///
    /// Walks every `(event, sensor)` pair in batch order. A sensor never
    /// seen before, or one whose timestamp has advanced past the throttle
    /// window, flips the batch to "forward"; once forwarding, every
    /// remaining parseable reading has its last-seen timestamp refreshed as
    /// well. Readings with unparseable timestamps are skipped and leave the
    /// decision and the bookkeeping untouched.
    pub fn should_throttle(&mut self, batch: &EventBatch) -> bool {
        let mut throttle = true;

        for (event, sensor) in batch.readings() {
            let key = self.sensor_key(&batch.context, sensor);

            let timestamp = match DateTime::parse_from_rfc3339(&sensor.timestamp) {
                Ok(ts) => ts,
                Err(err) => {
                    warn!(
                        context = %batch.context,
                        message_id = %event.message_id,
                        ?sensor,
                        %err,
                        "unable to parse timestamp in sensor reading"
                    );
                    continue;
                }
            };

            let last = self.sensor_times.get(&key).copied();

            if last.is_none() {
                debug!(key, "found new sensor");
                throttle = false;
            }

            let due = match last {
                Some(last) => {
                    last + self.throttle_period - Duration::milliseconds(THROTTLE_JITTER_MS)
                        < timestamp
                }
                None => true,
            };

            // Once the batch is going out, refresh every sensor's last-seen
            // so the next batch is not forwarded just because a different
            // sensor was stale.
            if !throttle || due {
                self.sensor_times.insert(key, timestamp);
                throttle = false;
            }
        }

        throttle
    }

    /// Stable 64-bit key for "this sensor in this batch context".
    fn sensor_key(&self, context: &str, sensor: &SensorReading) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(self.key0, self.key1);
        hasher.write(context.as_bytes());
        hasher.write(sensor.location.as_bytes());
        hasher.write(sensor.physical_context.as_bytes());
        hasher.write(sensor.parental_context.as_bytes());
        hasher.write(sensor.physical_sub_context.as_bytes());
        hasher.write(sensor.device_specific_context.as_bytes());
        if let Some(index) = sensor.index {
            hasher.write(index.to_string().as_bytes());
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use throttle_common::{Event, SensorGroup};

    fn reading(location: &str, timestamp: &str) -> SensorReading {
        SensorReading {
            timestamp: timestamp.into(),
            location: location.into(),
            physical_context: "VoltageRegulator".into(),
            value: "42".into(),
            ..Default::default()
        }
    }

    fn batch(context: &str, readings: Vec<SensorReading>) -> EventBatch {
        EventBatch {
            context: context.into(),
            events: vec![Event {
                message_id: "CrayTelemetry.Temperature".into(),
                oem: Some(SensorGroup {
                    sensors: readings,
                    telemetry_source: "cC".into(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn first_sighting_is_not_throttled() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        let b = batch("c1", vec![reading("L", "2024-01-01T00:00:00Z")]);
        assert!(!filter.should_throttle(&b));
        assert_eq!(filter.sensor_times.len(), 1);
    }

    #[test]
    fn immediate_duplicate_is_throttled() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        let b = batch("c1", vec![reading("L", "2024-01-01T00:00:00Z")]);
        assert!(!filter.should_throttle(&b));
        assert!(filter.should_throttle(&b));
    }

    #[test]
    fn timestamp_past_window_is_not_throttled() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        assert!(!filter.should_throttle(&batch("c1", vec![reading("L", "2024-01-01T00:00:00Z")])));
        assert!(filter.should_throttle(&batch("c1", vec![reading("L", "2024-01-01T00:00:30Z")])));

        let advanced = batch("c1", vec![reading("L", "2024-01-01T00:01:00Z")]);
        assert!(!filter.should_throttle(&advanced));

        // Bookkeeping moved to the forwarded timestamp, not the throttled one.
        let key = filter.sensor_key("c1", &reading("L", ""));
        let last = filter.sensor_times[&key];
        assert_eq!(last.to_rfc3339(), "2024-01-01T00:01:00+00:00");
    }

    #[test]
    fn jitter_slack_lets_slightly_early_readings_through() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        assert!(!filter.should_throttle(&batch("c1", vec![reading("L", "2024-01-01T00:00:00Z")])));

        // 59.950s later: inside the window but within the 100ms slack.
        let early = batch("c1", vec![reading("L", "2024-01-01T00:00:59.950Z")]);
        assert!(!filter.should_throttle(&early));
    }

    #[test]
    fn unseen_sensor_forces_mixed_batch_through() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        assert!(!filter.should_throttle(&batch("c1", vec![reading("L1", "2024-01-01T00:00:00Z")])));

        // L1 is still inside its window, but L2 has never been seen. L2
        // flips the decision, and every reading processed after the flip is
        // refreshed as well.
        let mixed = batch(
            "c1",
            vec![
                reading("L2", "2024-01-01T00:00:05Z"),
                reading("L1", "2024-01-01T00:00:05Z"),
            ],
        );
        assert!(!filter.should_throttle(&mixed));

        // Both sensors were refreshed to the forwarded batch's timestamps.
        for location in ["L1", "L2"] {
            let key = filter.sensor_key("c1", &reading(location, ""));
            assert_eq!(
                filter.sensor_times[&key].to_rfc3339(),
                "2024-01-01T00:00:05+00:00"
            );
        }
    }

    #[test]
    fn seen_reading_before_the_flip_keeps_its_bookkeeping() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        assert!(!filter.should_throttle(&batch("c1", vec![reading("L1", "2024-01-01T00:00:00Z")])));

        // L1 first in batch order and throttled on its own; L2 flips the
        // decision afterwards, but L1 was already passed over, so only a
        // second pass semantics would refresh it. The filter is single-pass:
        // L1 keeps its old bookkeeping, L2 records.
        let mixed = batch(
            "c1",
            vec![
                reading("L1", "2024-01-01T00:00:05Z"),
                reading("L2", "2024-01-01T00:00:05Z"),
            ],
        );
        assert!(!filter.should_throttle(&mixed));

        // And a following batch where only L1 is fresh relative to its last
        // recorded time is forwarded again.
        let followup = batch("c1", vec![reading("L1", "2024-01-01T00:01:10Z")]);
        assert!(!filter.should_throttle(&followup));
    }

    #[test]
    fn empty_batch_is_throttled_without_state_change() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        assert!(filter.should_throttle(&batch("c1", vec![])));
        assert!(filter.should_throttle(&EventBatch::default()));
        assert!(filter.sensor_times.is_empty());
    }

    #[test]
    fn unparseable_timestamps_are_skipped() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));

        // Every reading bad: throttled, no state.
        let all_bad = batch("c1", vec![reading("L", "not-a-timestamp")]);
        assert!(filter.should_throttle(&all_bad));
        assert!(filter.sensor_times.is_empty());

        // A bad reading does not block a good one.
        let mixed = batch(
            "c1",
            vec![
                reading("L1", "garbage"),
                reading("L2", "2024-01-01T00:00:00Z"),
            ],
        );
        assert!(!filter.should_throttle(&mixed));
        assert_eq!(filter.sensor_times.len(), 1);
    }

    #[test]
    fn steady_stream_emits_once_per_period() {
        // T = 60s, readings every 20s: expect one forward per 3 batches.
        let mut filter = TopicFilter::new(StdDuration::from_secs(60));
        let mut forwarded = 0;
        for i in 0..12 {
            let ts = format!("2024-01-01T00:{:02}:{:02}Z", (i * 20) / 60, (i * 20) % 60);
            if !filter.should_throttle(&batch("c1", vec![reading("L", &ts)])) {
                forwarded += 1;
            }
        }
        assert_eq!(forwarded, 4);
    }

    #[test]
    fn sensor_key_is_stable_and_context_sensitive() {
        let filter = TopicFilter::new(StdDuration::from_secs(60));
        let r = reading("L", "2024-01-01T00:00:00Z");

        assert_eq!(filter.sensor_key("c1", &r), filter.sensor_key("c1", &r));
        assert_ne!(filter.sensor_key("c1", &r), filter.sensor_key("c2", &r));

        let mut indexed = r.clone();
        indexed.index = Some(3);
        assert_ne!(filter.sensor_key("c1", &r), filter.sensor_key("c1", &indexed));
    }

    #[test]
    fn distinct_filters_use_distinct_seeds() {
        let a = TopicFilter::new(StdDuration::from_secs(60));
        let b = TopicFilter::new(StdDuration::from_secs(60));
        assert!(a.key0 != b.key0 || a.key1 != b.key1);
    }

    #[test]
    fn zero_period_filter_always_forwards_advancing_readings() {
        let mut filter = TopicFilter::new(StdDuration::from_secs(0));
        assert!(!filter.should_throttle(&batch("c1", vec![reading("L", "2024-01-01T00:00:00Z")])));
        assert!(!filter.should_throttle(&batch("c1", vec![reading("L", "2024-01-01T00:00:01Z")])));
    }
}
