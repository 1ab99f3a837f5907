//! Session descriptors
//!
//! A session is one logical log-viewing request spanning one or more sources.
//! The manager owns the live state; callers only ever see [`Session`]
//! snapshots taken under the session lock.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::SessionId;
use crate::registry::ResourceKey;
use crate::source::Source;

/// Param key holding the comma-separated list of enabled source IDs
pub const ENABLED_SOURCES_PARAM: &str = "enabled_sources";

/// Session status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Lines are forwarded to the output channel
    Active,
    /// Lines are read and discarded
    Paused,
    /// The session was closed and removed from the table
    Closed,
    /// The session failed terminally
    Error,
}

impl SessionStatus {
    /// Whether the session can no longer change state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Options controlling what a session streams
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Resolver-specific target filter (e.g. a container name)
    pub target: Option<String>,
    /// Keep streams open and reconnect when they end
    pub follow: bool,
    /// Also fetch logs of the previous instance of each source
    pub include_previous: bool,
    /// Ask handlers to prefix lines with timestamps
    pub timestamps: bool,
    /// Only the last N lines of existing content
    pub tail_lines: Option<u64>,
    /// Only lines newer than this many seconds
    pub since_seconds: Option<u64>,
    /// Only lines newer than this time
    pub since_time: Option<DateTime<Utc>>,
    /// Stop after this many bytes per stream
    pub limit_bytes: Option<u64>,
    /// Emit `SourceAdded` / `SourceRemoved` events
    pub include_source_events: bool,
    /// Resolver-specific knobs
    pub params: HashMap<String, String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            target: None,
            follow: false,
            include_previous: false,
            timestamps: false,
            tail_lines: None,
            since_seconds: None,
            since_time: None,
            limit_bytes: None,
            include_source_events: true,
            params: HashMap::new(),
        }
    }
}

impl SessionOptions {
    /// Options for a live, following session
    #[must_use]
    pub fn follow() -> Self {
        Self {
            follow: true,
            ..Self::default()
        }
    }

    /// Set a resolver param
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The enabled-source filter, if the caller supplied one
    #[must_use]
    pub fn enabled_sources(&self) -> Option<EnabledSources> {
        self.params
            .get(ENABLED_SOURCES_PARAM)
            .map(|raw| EnabledSources::parse(raw))
    }

    /// Whether a source passes the enabled-source filter
    #[must_use]
    pub fn is_source_enabled(&self, source_id: &str) -> bool {
        self.enabled_sources()
            .map_or(true, |enabled| enabled.contains(source_id))
    }
}

/// Selection of sources within an already resolved set
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnabledSources {
    /// Every source
    All,
    /// Only the listed source IDs
    Only(HashSet<String>),
}

impl EnabledSources {
    /// Parse a comma list; an empty (or all-blank) list means every source
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let ids: HashSet<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .collect();

        if ids.is_empty() {
            Self::All
        } else {
            Self::Only(ids)
        }
    }

    /// Whether the source is selected
    #[must_use]
    pub fn contains(&self, source_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(source_id),
        }
    }
}

/// Snapshot of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,
    /// Resource type the session streams from
    pub resource_key: ResourceKey,
    /// Resource instance the session streams from
    pub resource_id: String,
    /// Current options
    pub options: SessionOptions,
    /// Current status
    pub status: SessionStatus,
    /// Sources currently selected for streaming
    pub active_sources: Vec<Source>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// IDs of the active sources
    #[must_use]
    pub fn active_source_ids(&self) -> Vec<&str> {
        self.active_sources.iter().map(|s| s.id.as_str()).collect()
    }
}
