//! Message Envelope
//!
//! Wraps each raw reading received from the local broker in an envelope
//! carrying the enrichment timestamp and fixed provenance fields:
//!
//! ```json
//! {
//!   "original_data": {"sensor_id": "sensor_01", "value": 22.5},
//!   "timestamp": "2024-05-01T12:00:00.000000+00:00",
//!   "processed_by": "mqtt-proxy",
//!   "source": "on-premises-mqtt"
//! }
//! ```
//!
//! Payloads that are not valid JSON are embedded as a string instead of a
//! nested object, or as an array of byte values when they are not UTF-8
//! text either. That fallback never fails and never loses bytes.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SerializationError;


/// Default `processed_by` value
pub const DEFAULT_PROCESSED_BY: &str = "mqtt-proxy";

/// Default `source` value
pub const DEFAULT_SOURCE: &str = "on-premises-mqtt";

/// A message as delivered by the local broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// The enriched wrapper forwarded to the remote broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Parsed JSON payload, the payload text when it is not JSON, or the
    /// payload bytes when it is not text
    pub original_data: Value,
    /// UTC ISO-8601 enrichment time
    pub timestamp: String,
    pub processed_by: String,
    pub source: String,
}

impl Envelope {
    /// Encode as compact JSON for publishing
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Encode as indented JSON for log output
    pub fn to_pretty_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Result of enriching one message
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub envelope: Envelope,
    /// Set when the payload was embedded as a string because it is not JSON
    pub fallback: Option<SerializationError>,
}

/// Builds envelopes with a fixed pair of provenance fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enricher {
    processed_by: String,
    source: String,
}

impl Enricher {
    pub fn new(processed_by: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            processed_by: processed_by.into(),
            source: source.into(),
        }
    }

    pub fn processed_by(&self) -> &str {
        &self.processed_by
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap `raw` in an envelope stamped with `now`.
    ///
    /// Pure: the same message and timestamp always produce the same envelope.
    pub fn enrich(&self, raw: &RawMessage, now: DateTime<Utc>) -> Enrichment {
        let (original_data, fallback) = match serde_json::from_slice::<Value>(&raw.payload) {
            Ok(value) => (value, None),
            Err(e) => (raw_value(&raw.payload), Some(SerializationError::from(e))),
        };

        Enrichment {
            envelope: Envelope {
                original_data,
                timestamp: format_timestamp(now),
                processed_by: self.processed_by.clone(),
                source: self.source.clone(),
            },
            fallback,
        }
    }
}

impl Default for Enricher {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSED_BY, DEFAULT_SOURCE)
    }
}

/// Non-JSON payload as text, or as its octets when it is not UTF-8
fn raw_value(payload: &[u8]) -> Value {
    match std::str::from_utf8(payload) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Array(payload.iter().map(|&b| Value::from(b)).collect()),
    }
}

/// Enrich with the default provenance fields
pub fn enrich(raw: &RawMessage, now: DateTime<Utc>) -> Envelope {
    Enricher::default().enrich(raw, now).envelope
}

/// ISO-8601 with microsecond precision and an explicit `+00:00` offset
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, false)
}
