//! Log sources
//!
//! A [`Source`] identifies one individually streamable log origin: one
//! container of a pod, one shard, one file. Sources are produced by handlers'
//! source builders or by resolvers and are never mutated afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One log-producing endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Identifier, unique within a session
    pub id: String,
    /// Free-form labels copied onto every line from this source
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Source {
    /// Create an unlabeled source
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: HashMap::new(),
        }
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Look up a label value
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Live membership change reported by a resolver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "source", rename_all = "snake_case")]
pub enum SourceEvent {
    /// A new source appeared in the group
    Added(Source),
    /// A source left the group
    Removed(Source),
}

impl SourceEvent {
    /// The source this event is about
    #[must_use]
    pub fn source(&self) -> &Source {
        match self {
            Self::Added(source) | Self::Removed(source) => source,
        }
    }
}
