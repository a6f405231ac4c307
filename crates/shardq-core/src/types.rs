use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ShardqError;

/// Hash partition index in `[0, num_partitions)`.
pub type PartitionId = u32;

/// `aggregate_type` stamped on every outbox record emitted for an event.
pub const AGGREGATE_TYPE_EVENT: &str = "EVENT";

/// Lifecycle state of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Submitted and waiting for its scheduled time.
    Pending,
    /// Claimed by a worker; `locked_at` holds the claim time.
    InProgress,
    /// Handler completed; an outbox record was committed with this status.
    Processed,
    /// Handler failed; `exception_stack_trace` holds the reason.
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::InProgress => "IN_PROGRESS",
            EventStatus::Processed => "PROCESSED",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = ShardqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "IN_PROGRESS" => Ok(EventStatus::InProgress),
            "PROCESSED" => Ok(EventStatus::Processed),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(ShardqError::InvalidStatus(other.to_string())),
        }
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique, immutable.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Optional tenant or application grouping supplied at submission.
    pub namespace: Option<String>,
    /// Sharding key, computed once at submission.
    pub partition_id: PartitionId,
    pub scheduled_time: DateTime<Utc>,
    /// Opaque payload handed to the task handler and copied to the outbox.
    pub payload: String,
    pub status: EventStatus,
    /// Claim timestamp; set only while `IN_PROGRESS`.
    pub locked_at: Option<DateTime<Utc>>,
    /// Populated only on `FAILED`.
    pub exception_stack_trace: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a fresh `PENDING` event.
    pub fn pending(
        id: impl Into<String>,
        name: impl Into<String>,
        partition_id: PartitionId,
        scheduled_time: DateTime<Utc>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            namespace: None,
            partition_id,
            scheduled_time,
            payload: payload.into(),
            status: EventStatus::Pending,
            locked_at: None,
            exception_stack_trace: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Whether the event is eligible for claiming at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.scheduled_time <= now
    }

    pub fn mark_processed(&mut self) {
        self.status = EventStatus::Processed;
        self.exception_stack_trace = None;
    }

    pub fn mark_failed(&mut self, trace: impl Into<String>) {
        self.status = EventStatus::Failed;
        self.exception_stack_trace = Some(trace.into());
    }
}

/// Request to submit a new event. `id` is generated when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: Option<String>,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub payload: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A durable message waiting to be delivered to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// UUID v4 primary key.
    pub id: String,
    /// Id of the event whose processing produced this record.
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// Inherited from the event so publishing stays partition-local.
    pub partition_id: PartitionId,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Outbox record for a finished event.
    pub fn for_event(event: &Event, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            aggregate_id: event.id.clone(),
            aggregate_type: AGGREGATE_TYPE_EVENT.to_string(),
            partition_id: event.partition_id,
            payload: event.payload.clone(),
            created_at,
        }
    }
}

/// Fixed-width RFC 3339 (microseconds, `Z` suffix) so that lexical order of
/// the stored text equals chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_parses_wire_names() {
        for status in [
            EventStatus::Pending,
            EventStatus::InProgress,
            EventStatus::Processed,
            EventStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<EventStatus>().is_err());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let base = Utc::now();
        let earlier = format_timestamp(base);
        let later = format_timestamp(base + Duration::milliseconds(5));
        assert!(earlier < later);
        assert_eq!(earlier.len(), later.len());
    }

    #[test]
    fn outbox_record_copies_event_identity() {
        let event = Event::pending("evt-1", "ping", 3, Utc::now(), "{\"n\":1}");
        let record = OutboxRecord::for_event(&event, Utc::now());
        assert_eq!(record.aggregate_id, "evt-1");
        assert_eq!(record.partition_id, 3);
        assert_eq!(record.payload, "{\"n\":1}");
        assert_eq!(record.aggregate_type, AGGREGATE_TYPE_EVENT);
    }

    #[test]
    fn only_pending_and_past_events_are_due() {
        let now = Utc::now();
        let mut event = Event::pending("a", "a", 0, now + Duration::seconds(10), "");
        assert!(!event.is_due(now));
        event.scheduled_time = now;
        assert!(event.is_due(now));
        event.status = EventStatus::InProgress;
        assert!(!event.is_due(now));
    }
}
