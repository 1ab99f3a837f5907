//! Stream Messages
//!
//! The units that cross the manager boundary. Every session and every source
//! of a [`Manager`](crate::Manager) shares one output channel, so each
//! [`StreamOutput`] carries the [`SessionId`] it belongs to and a consumer
//! demultiplexes on it. Control flows the other way as [`StreamInput`].
//!
//! # Ordering
//!
//! Lines of a single source keep their read order. Nothing is guaranteed
//! across sources, or across reconnect cycles of the same source.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a session
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("session_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Lines
// ============================================================================

/// Where a line came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineOrigin {
    /// The live (current) stream of the source
    #[default]
    Current,
    /// The previous instance of the source (e.g. a restarted container)
    Previous,
    /// Synthesized by the manager itself
    System,
}

/// One parsed log line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Session the line was read for
    pub session_id: SessionId,
    /// Source that produced the line (empty for system lines)
    pub source_id: String,
    /// Labels of the producing source
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Timestamp parsed from the line prefix, or the read time
    pub timestamp: DateTime<Utc>,
    /// The line without its timestamp prefix
    pub content: String,
    /// Where the line came from
    #[serde(default)]
    pub origin: LineOrigin,
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Kind of lifecycle event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// A source joined the session
    SourceAdded,
    /// A source left the session
    SourceRemoved,
    /// Terminal failure of a source or of the whole session
    StreamError,
    /// A source is about to retry after a backoff delay
    Reconnecting,
    /// A source reopened its stream after failed attempts
    Reconnected,
    /// A source's finite stream reached its end
    StreamEnded,
}

/// A lifecycle signal for a source or a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event kind
    pub kind: StreamEventKind,
    /// Source the event is about; `None` for session-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Human-readable detail
    #[serde(default)]
    pub message: String,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Wire Units
// ============================================================================

/// Exactly one line or one event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutputPayload {
    /// A log line
    Line(Line),
    /// A lifecycle event
    Event(StreamEvent),
}

/// The unit on the shared output channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOutput {
    /// Session this output belongs to
    pub session_id: SessionId,
    /// The line or event
    pub payload: OutputPayload,
}

impl StreamOutput {
    /// Wrap a line
    #[must_use]
    pub fn line(line: Line) -> Self {
        Self {
            session_id: line.session_id.clone(),
            payload: OutputPayload::Line(line),
        }
    }

    /// Wrap an event
    #[must_use]
    pub fn event(session_id: SessionId, event: StreamEvent) -> Self {
        Self {
            session_id,
            payload: OutputPayload::Event(event),
        }
    }

    /// The line, if this output carries one
    #[must_use]
    pub fn as_line(&self) -> Option<&Line> {
        match &self.payload {
            OutputPayload::Line(line) => Some(line),
            OutputPayload::Event(_) => None,
        }
    }

    /// The event, if this output carries one
    #[must_use]
    pub fn as_event(&self) -> Option<&StreamEvent> {
        match &self.payload {
            OutputPayload::Event(event) => Some(event),
            OutputPayload::Line(_) => None,
        }
    }
}

/// Control command for a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamCommand {
    /// Stop forwarding lines (readers keep reading and discard)
    Pause,
    /// Resume forwarding lines
    Resume,
    /// Close the session
    Close,
}

/// The unit on the shared input channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInput {
    /// Target session
    pub session_id: SessionId,
    /// Command to apply
    pub command: StreamCommand,
}

impl StreamInput {
    /// Build a command for a session
    pub fn new(session_id: impl Into<SessionId>, command: StreamCommand) -> Self {
        Self {
            session_id: session_id.into(),
            command,
        }
    }
}
