//! Wire events and priority classification.
//!
//! Every event broadcast by a job carries a `type` string and an arbitrary
//! JSON payload, delivered as `{"type": <string>, "data": <json>}` over
//! either transport. The event's kind maps to a [`Priority`] tier that
//! governs its delivery guarantees when a subscriber's mailbox is full:
//! critical events are retried and never silently lost, lower tiers are
//! dropped for that subscriber only.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Semantic type of a broadcast event.
///
/// The known variants cover every type the relay engine itself emits;
/// producer-defined types flow through as [`EventKind::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Terminal: generation finished (successfully or cancelled).
    Done,
    /// Terminal: generation failed.
    Error,
    /// A chat log entry was persisted.
    LogCreated,
    /// Incremental response text.
    Chunk,
    /// A new session was created for the owner.
    SessionCreated,
    /// The session title changed.
    SessionTitleUpdated,
    /// Header for an intermediate reasoning block.
    ThoughtHeader,
    /// Progress notification from a running tool.
    ToolProgress,
    /// A tool was invoked.
    ToolCall,
    /// Output produced by a tool.
    ToolOutput,
    /// A tool failed.
    ToolError,
    /// Token/cost usage update.
    UsageUpdate,
    /// Reply to a client `ping`.
    Pong,
    /// Producer-defined type unknown to the engine.
    Other(String),
}

impl EventKind {
    /// The wire `type` string for this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
            Self::LogCreated => "log_created",
            Self::Chunk => "chunk",
            Self::SessionCreated => "session_created",
            Self::SessionTitleUpdated => "session_title_updated",
            Self::ThoughtHeader => "thought_header",
            Self::ToolProgress => "tool_progress",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
            Self::ToolError => "tool_error",
            Self::UsageUpdate => "usage_update",
            Self::Pong => "pong",
            Self::Other(s) => s,
        }
    }

    /// Delivery priority tier for this kind.
    ///
    /// Unknown kinds classify as [`Priority::Low`] (best-effort only).
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            Self::Done | Self::Error | Self::LogCreated => Priority::Critical,
            Self::Chunk | Self::SessionCreated | Self::SessionTitleUpdated => Priority::High,
            Self::ThoughtHeader => Priority::Medium,
            Self::ToolProgress
            | Self::ToolCall
            | Self::ToolOutput
            | Self::ToolError
            | Self::UsageUpdate
            | Self::Pong
            | Self::Other(_) => Priority::Low,
        }
    }

    /// Whether this kind ends the logical stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "error" => Self::Error,
            "log_created" => Self::LogCreated,
            "chunk" => Self::Chunk,
            "session_created" => Self::SessionCreated,
            "session_title_updated" => Self::SessionTitleUpdated,
            "thought_header" => Self::ThoughtHeader,
            "tool_progress" => Self::ToolProgress,
            "tool_call" => Self::ToolCall,
            "tool_output" => Self::ToolOutput,
            "tool_error" => Self::ToolError,
            "usage_update" => Self::UsageUpdate,
            "pong" => Self::Pong,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl de::Visitor<'_> for KindVisitor {
            type Value = EventKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an event type string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<EventKind, E> {
                Ok(EventKind::from(v))
            }
        }

        deserializer.deserialize_str(KindVisitor)
    }
}

/// Delivery priority tier.
///
/// Variant order matters: the derived `Ord` ranks `Critical` highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Best-effort; dropped silently when a mailbox is full.
    Low,
    /// Bounded send; dropped quietly on timeout.
    Medium,
    /// Bounded send; dropped with a warning on timeout.
    High,
    /// Bounded send plus one async retry; a loss is logged loudly.
    Critical,
}

impl Priority {
    /// Short label for logging.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// One broadcast event: immutable once created.
///
/// `seq` is a monotonic counter scoped to a single job (assigned at
/// broadcast time, equal to the event's index in the job history). It is
/// engine-internal and not part of the wire envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Semantic type of the event.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Arbitrary structured payload.
    pub data: Value,
    /// Position in the owning job's history.
    #[serde(skip)]
    pub seq: u64,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(kind: EventKind, data: Value, seq: u64) -> Self {
        Self { kind, data, seq }
    }

    /// Delivery priority of this event.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.kind.priority()
    }

    /// Serialize to the wire envelope `{"type": ..., "data": ...}`.
    ///
    /// Serialization of a `Value` payload cannot realistically fail; if it
    /// ever does the frame is replaced with a minimal error envelope.
    #[must_use]
    pub fn wire_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","data":"serialization failed"}"#.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_table_matches_contract() {
        for kind in ["done", "error", "log_created"] {
            assert_eq!(EventKind::from(kind).priority(), Priority::Critical, "{kind}");
        }
        for kind in ["chunk", "session_created", "session_title_updated"] {
            assert_eq!(EventKind::from(kind).priority(), Priority::High, "{kind}");
        }
        assert_eq!(EventKind::ThoughtHeader.priority(), Priority::Medium);
        for kind in [
            "tool_progress",
            "tool_call",
            "tool_output",
            "tool_error",
            "usage_update",
            "pong",
        ] {
            assert_eq!(EventKind::from(kind).priority(), Priority::Low, "{kind}");
        }
    }

    #[test]
    fn unknown_kind_is_low_priority() {
        let kind = EventKind::from("some_future_type");
        assert_eq!(kind, EventKind::Other("some_future_type".into()));
        assert_eq!(kind.priority(), Priority::Low);
    }

    #[test]
    fn kind_string_round_trip() {
        for s in [
            "done",
            "error",
            "log_created",
            "chunk",
            "session_created",
            "session_title_updated",
            "thought_header",
            "tool_progress",
            "tool_call",
            "tool_output",
            "tool_error",
            "usage_update",
            "pong",
            "custom_thing",
        ] {
            assert_eq!(EventKind::from(s).as_str(), s);
        }
    }

    #[test]
    fn terminal_kinds() {
        assert!(EventKind::Done.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(!EventKind::Chunk.is_terminal());
        assert!(!EventKind::Pong.is_terminal());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn wire_envelope_shape() {
        let event = Event::new(EventKind::Chunk, json!("Hi"), 7);
        let parsed: Value = serde_json::from_str(&event.wire_json()).unwrap();
        assert_eq!(parsed["type"], "chunk");
        assert_eq!(parsed["data"], "Hi");
        // seq is engine-internal, never on the wire
        assert!(parsed.get("seq").is_none());
    }

    #[test]
    fn wire_envelope_structured_data() {
        let event = Event::new(
            EventKind::ToolCall,
            json!({"name": "search", "args": {"q": "rust"}}),
            0,
        );
        let parsed: Value = serde_json::from_str(&event.wire_json()).unwrap();
        assert_eq!(parsed["data"]["name"], "search");
    }

    #[test]
    fn deserialize_envelope() {
        let event: Event = serde_json::from_str(r#"{"type":"done","data":"ok"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Done);
        assert_eq!(event.data, json!("ok"));
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn kind_display() {
        assert_eq!(EventKind::UsageUpdate.to_string(), "usage_update");
        assert_eq!(EventKind::Other("x".into()).to_string(), "x");
    }
}
