//! Typed event model and the flat wire codec used on the store.
//!
//! Each event kind maps to its own stream; within a stream, append order
//! is what consumer groups observe. Records on the wire are flat
//! string maps with the payload carried as one JSON field, so a record
//! written by any producer version stays readable.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::EngineError;
use pulse_store::StreamRecord;

/// Stream carrying memory-service operation events.
pub const STREAM_OPERATIONS: &str = "pulse:events:operations";
/// Stream carrying user interaction events.
pub const STREAM_INTERACTIONS: &str = "pulse:events:interactions";
/// Stream carrying system metric samples.
pub const STREAM_METRICS: &str = "pulse:events:metrics";
/// Stream carrying service error reports.
pub const STREAM_ERRORS: &str = "pulse:events:errors";

/// Closed set of event kinds the pipeline understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Operation,
    Interaction,
    Metric,
    Error,
}

impl EventType {
    /// The store stream this event kind is appended to.
    pub fn stream(&self) -> &'static str {
        match self {
            Self::Operation => STREAM_OPERATIONS,
            Self::Interaction => STREAM_INTERACTIONS,
            Self::Metric => STREAM_METRICS,
            Self::Error => STREAM_ERRORS,
        }
    }
}

/// Typed payload, one variant per event kind.
///
/// Fields the model does not know about travel in [`StreamEvent::extra`]
/// instead of loosening these variants into open maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Operation {
        /// Operation name, e.g. `store_memory` or `recall`.
        name: String,
        duration_ms: f64,
        success: bool,
    },
    Interaction {
        action: String,
        duration_ms: f64,
    },
    Metric {
        name: String,
        value: f64,
        unit: String,
    },
    Error {
        #[serde(rename = "error_kind")]
        kind: String,
        message: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Operation { .. } => EventType::Operation,
            Self::Interaction { .. } => EventType::Interaction,
            Self::Metric { .. } => EventType::Metric,
            Self::Error { .. } => EventType::Error,
        }
    }
}

/// One operational event. Immutable once produced: created by the
/// producer, persisted by the store, read-only to the workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: EventPayload,
    /// Forward-compatible extension fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl StreamEvent {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: payload.event_type(),
            timestamp: Utc::now(),
            source: source.into(),
            user_id: None,
            session_id: None,
            payload,
            extra: serde_json::Map::new(),
        }
    }

    pub fn operation(
        source: impl Into<String>,
        name: impl Into<String>,
        duration_ms: f64,
        success: bool,
    ) -> Self {
        Self::new(
            source,
            EventPayload::Operation {
                name: name.into(),
                duration_ms,
                success,
            },
        )
    }

    pub fn interaction(
        source: impl Into<String>,
        action: impl Into<String>,
        duration_ms: f64,
    ) -> Self {
        Self::new(
            source,
            EventPayload::Interaction {
                action: action.into(),
                duration_ms,
            },
        )
    }

    pub fn metric(
        source: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self::new(
            source,
            EventPayload::Metric {
                name: name.into(),
                value,
                unit: unit.into(),
            },
        )
    }

    pub fn error_report(
        source: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            source,
            EventPayload::Error {
                kind: kind.into(),
                message: message.into(),
            },
        )
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Flatten to the wire record appended to the store.
    pub fn to_record(&self) -> Result<StreamRecord, EngineError> {
        let mut record = StreamRecord::new();
        record.insert("event_id".to_string(), self.event_id.to_string());
        record.insert("event_type".to_string(), self.event_type.to_string());
        record.insert("timestamp".to_string(), self.timestamp.to_rfc3339());
        record.insert("source".to_string(), self.source.clone());
        if let Some(user_id) = &self.user_id {
            record.insert("user_id".to_string(), user_id.clone());
        }
        if let Some(session_id) = &self.session_id {
            record.insert("session_id".to_string(), session_id.clone());
        }
        record.insert(
            "payload".to_string(),
            serde_json::to_string(&self.payload)
                .map_err(|e| EngineError::parse(format!("payload encode: {e}")))?,
        );
        if !self.extra.is_empty() {
            record.insert(
                "extra".to_string(),
                serde_json::to_string(&self.extra)
                    .map_err(|e| EngineError::parse(format!("extra encode: {e}")))?,
            );
        }
        Ok(record)
    }

    /// Parse a wire record back into an event.
    pub fn from_record(record: &StreamRecord) -> Result<Self, EngineError> {
        let field = |name: &str| {
            record
                .get(name)
                .ok_or_else(|| EngineError::parse(format!("missing field `{name}`")))
        };

        let event_id = Uuid::parse_str(field("event_id")?)
            .map_err(|e| EngineError::parse(format!("event_id: {e}")))?;
        let event_type = EventType::from_str(field("event_type")?)
            .map_err(|e| EngineError::parse(format!("event_type: {e}")))?;
        let timestamp = DateTime::parse_from_rfc3339(field("timestamp")?)
            .map_err(|e| EngineError::parse(format!("timestamp: {e}")))?
            .with_timezone(&Utc);
        let payload: EventPayload = serde_json::from_str(field("payload")?)
            .map_err(|e| EngineError::parse(format!("payload: {e}")))?;
        let extra = match record.get("extra") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| EngineError::parse(format!("extra: {e}")))?,
            None => serde_json::Map::new(),
        };

        Ok(Self {
            event_id,
            event_type,
            timestamp,
            source: field("source")?.clone(),
            user_id: record.get("user_id").cloned(),
            session_id: record.get("session_id").cloned(),
            payload,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_maps_to_distinct_streams() {
        let streams = [
            EventType::Operation.stream(),
            EventType::Interaction.stream(),
            EventType::Metric.stream(),
            EventType::Error.stream(),
        ];
        for (i, a) in streams.iter().enumerate() {
            for b in &streams[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn wire_record_round_trips() {
        let event = StreamEvent::operation("memory-service", "store_memory", 12.5, true)
            .with_user("u-42")
            .with_session("s-1")
            .with_extra("region", Value::String("eu".to_string()));

        let record = event.to_record().unwrap();
        let parsed = StreamEvent::from_record(&record).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn optional_fields_are_omitted_from_the_record() {
        let event = StreamEvent::metric("host-agent", "cpu_percent", 41.0, "percent");
        let record = event.to_record().unwrap();
        assert!(!record.contains_key("user_id"));
        assert!(!record.contains_key("session_id"));
        assert!(!record.contains_key("extra"));
    }

    #[test]
    fn malformed_records_fail_to_parse() {
        let event = StreamEvent::interaction("ide", "completion_accept", 80.0);
        let mut record = event.to_record().unwrap();
        record.remove("timestamp");
        assert!(StreamEvent::from_record(&record).is_err());

        let mut bad_payload = event.to_record().unwrap();
        bad_payload.insert("payload".to_string(), "{not json".to_string());
        assert!(StreamEvent::from_record(&bad_payload).is_err());
    }

    #[test]
    fn payload_kind_matches_event_type() {
        let event = StreamEvent::error_report("memory-service", "timeout", "backend timed out");
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.payload.event_type(), EventType::Error);
    }
}
