//! # Event Structures and Definitions
//!
//! `Event` is the unit of work the triple-queue engine moves between pools.
//! The wire format (see spec §6.1) is bit-exact: field names and JSON
//! `null` vs. absent semantics matter because nodes exchange this structure
//! directly over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved event type marking an engine-generated cumulative batch.
pub const CUMULATIVE_EVENT_TYPE: &str = "cumulative";

/// Prefix reserved for FSM command events (`CMD_RUN`, `CMD_PAUSE`, ...).
pub const CMD_PREFIX: &str = "CMD_";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next monotonic, process-unique event id.
pub fn next_event_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Known result outcomes. The wire field itself stays a plain string (a peer
/// may send a value we don't recognize and we must still round-trip it), so
/// this enum is a convenience classifier rather than the serialized type —
/// see `EventResult::kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    Failure,
    Timeout,
    Rejected,
    Other,
}

/// Structured outcome attached to a reply event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    /// `success`, `failure`, or any peer-defined outcome string.
    pub result: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventResult {
    pub fn success() -> Self {
        Self {
            result: "success".to_string(),
            error_code: None,
            error_message: None,
            data: None,
        }
    }

    pub fn success_with_data(data: Value) -> Self {
        Self {
            result: "success".to_string(),
            error_code: None,
            error_message: None,
            data: Some(data),
        }
    }

    pub fn failure<S: Into<String>>(error_message: S) -> Self {
        Self {
            result: "failure".to_string(),
            error_code: None,
            error_message: Some(error_message.into()),
            data: None,
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self.result.as_str() {
            "success" => ResultKind::Success,
            "failure" => ResultKind::Failure,
            "timeout" => ResultKind::Timeout,
            "rejected" => ResultKind::Rejected,
            _ => ResultKind::Other,
        }
    }
}

fn default_endpoint() -> String {
    "/event".to_string()
}

fn default_payload() -> f64 {
    1.0
}

/// The immutable envelope carrying routing, correlation, payload and result.
///
/// `timestamp` doubles as the pool key (see `pool` module) — it uniquely
/// identifies the event within whichever pool currently holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,

    pub source: String,
    pub source_address: String,
    pub source_port: u16,

    pub destination: String,
    pub destination_address: String,
    pub destination_port: u16,
    #[serde(default = "default_endpoint")]
    pub destination_endpoint: String,

    pub event_type: String,

    /// Instant this event was created at its origin node. Precision is at
    /// least microseconds; this also serves as the pool's ordering/identity
    /// key (spec §3.1/§3.3).
    pub timestamp: DateTime<Utc>,

    #[serde(default = "default_payload")]
    pub payload: f64,

    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EventResult>,

    #[serde(default)]
    pub is_processing: bool,

    #[serde(default)]
    pub is_system_event: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_processing_time: Option<f64>,
}

impl Event {
    /// Build a new user event with a freshly allocated id and `now()` timestamp.
    pub fn new(
        source: impl Into<String>,
        source_address: impl Into<String>,
        source_port: u16,
        destination: impl Into<String>,
        destination_address: impl Into<String>,
        destination_port: u16,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: next_event_id(),
            source: source.into(),
            source_address: source_address.into(),
            source_port,
            destination: destination.into(),
            destination_address: destination_address.into(),
            destination_port,
            destination_endpoint: default_endpoint(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: default_payload(),
            data,
            result: None,
            is_processing: false,
            is_system_event: false,
            maximum_processing_time: None,
        }
    }

    pub fn is_cumulative(&self) -> bool {
        self.event_type == CUMULATIVE_EVENT_TYPE
    }

    pub fn is_command(&self) -> bool {
        self.event_type.starts_with(CMD_PREFIX)
    }

    /// Build the reply event for this request: source/destination swapped,
    /// same timestamp (reply correlation is by timestamp, spec §4.4/§9),
    /// `result` populated.
    pub fn into_reply(&self, result: EventResult) -> Event {
        Event {
            id: next_event_id(),
            source: self.destination.clone(),
            source_address: self.destination_address.clone(),
            source_port: self.destination_port,
            destination: self.source.clone(),
            destination_address: self.source_address.clone(),
            destination_port: self.source_port,
            destination_endpoint: default_endpoint(),
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            payload: default_payload(),
            data: Value::Null,
            result: Some(result),
            is_processing: false,
            is_system_event: self.is_system_event,
            maximum_processing_time: None,
        }
    }

    /// Build the cumulative event wrapping a batch of originals bound for
    /// the same destination (spec §4.5 step 2).
    pub fn cumulative(originals: &[Event]) -> Event {
        let first = originals
            .first()
            .expect("cumulative() requires at least one original event");
        let payload_sum: f64 = originals.iter().map(|e| e.payload).sum();
        let events_json: Vec<Value> = originals
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();

        Event {
            id: next_event_id(),
            source: first.source.clone(),
            source_address: first.source_address.clone(),
            source_port: first.source_port,
            destination: first.destination.clone(),
            destination_address: first.destination_address.clone(),
            destination_port: first.destination_port,
            destination_endpoint: first.destination_endpoint.clone(),
            event_type: CUMULATIVE_EVENT_TYPE.to_string(),
            timestamp: Utc::now(),
            payload: payload_sum,
            data: serde_json::json!({ "events": events_json }),
            result: None,
            is_processing: false,
            is_system_event: true,
            maximum_processing_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event::new("A", "10.0.0.1", 9000, "B", "10.0.0.2", 9001, "ping", Value::Null)
    }

    #[test]
    fn new_event_has_default_endpoint_and_payload() {
        let e = sample();
        assert_eq!(e.destination_endpoint, "/event");
        assert_eq!(e.payload, 1.0);
        assert!(!e.is_processing);
        assert!(!e.is_system_event);
    }

    #[test]
    fn reply_swaps_source_and_destination_and_keeps_timestamp() {
        let e = sample();
        let reply = e.into_reply(EventResult::success());
        assert_eq!(reply.source, e.destination);
        assert_eq!(reply.destination, e.source);
        assert_eq!(reply.timestamp, e.timestamp);
        assert!(reply.result.is_some());
        assert_eq!(reply.result.unwrap().kind(), ResultKind::Success);
    }

    #[test]
    fn cumulative_sums_payload_and_marks_system_event() {
        let events = vec![sample(), sample(), sample()];
        let cum = Event::cumulative(&events);
        assert_eq!(cum.event_type, CUMULATIVE_EVENT_TYPE);
        assert_eq!(cum.payload, 3.0);
        assert!(cum.is_system_event);
        assert!(cum.is_cumulative());
        let inner = cum.data.get("events").unwrap().as_array().unwrap();
        assert_eq!(inner.len(), 3);
    }

    #[test]
    fn command_detection() {
        let mut e = sample();
        e.event_type = "CMD_RUN".to_string();
        assert!(e.is_command());
    }

    #[test]
    fn result_round_trips_unknown_strings() {
        let json = serde_json::json!({"result": "partially_applied"});
        let r: EventResult = serde_json::from_value(json).unwrap();
        assert_eq!(r.kind(), ResultKind::Other);
        assert_eq!(r.result, "partially_applied");
    }

    #[test]
    fn event_ids_are_monotonic() {
        let a = next_event_id();
        let b = next_event_id();
        assert!(b > a);
    }
}
