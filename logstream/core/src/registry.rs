//! Handler Registry
//!
//! Plugin authors register one [`Handler`] per streamable resource type and
//! optionally one [`SourceResolver`] per "group" resource type. A resolver
//! expands a group (a deployment, a directory) into [`Source`]s which are then
//! opened through a handler registered under another key.
//!
//! All keys are checked once, in [`HandlerRegistryBuilder::build`]. A request
//! then costs a single map lookup returning a ready [`Route`].

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::{HandlerError, RegistryError};
use crate::session::SessionOptions;
use crate::source::{Source, SourceEvent};

/// Identifies a resource type (e.g. `core::v1::Pod`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(pub String);

impl ResourceKey {
    /// Create a key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// An open log byte stream
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Everything a handler needs to open one source's stream
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// The source to open
    pub source: Source,
    /// Resource instance the session streams from
    pub resource_id: String,
    /// Opaque resource description supplied at session creation
    pub resource_data: serde_json::Value,
    /// Session options at the time of the attempt
    pub options: SessionOptions,
    /// Open the previous instance's logs instead of the live stream
    pub previous: bool,
}

/// Opens byte streams for sources
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Open the stream for one source
    async fn open(&self, request: &StreamRequest) -> Result<LogStream, HandlerError>;
}

/// Materializes the source set of a resource
pub type SourceBuilder = Arc<
    dyn Fn(&str, &serde_json::Value, &SessionOptions) -> Result<Vec<Source>, HandlerError>
        + Send
        + Sync,
>;

/// A registered stream handler
#[derive(Clone)]
pub struct Handler {
    opener: Arc<dyn StreamOpener>,
    source_builder: Option<SourceBuilder>,
}

impl Handler {
    /// Create a handler without a source builder
    pub fn new(opener: impl StreamOpener + 'static) -> Self {
        Self {
            opener: Arc::new(opener),
            source_builder: None,
        }
    }

    /// Attach a source builder
    #[must_use]
    pub fn with_source_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&str, &serde_json::Value, &SessionOptions) -> Result<Vec<Source>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.source_builder = Some(Arc::new(builder));
        self
    }

    /// Open the stream for one source
    pub async fn open(&self, request: &StreamRequest) -> Result<LogStream, HandlerError> {
        self.opener.open(request).await
    }

    /// Materialize the sources of a resource
    ///
    /// Without a source builder the resource itself is the only source.
    pub fn sources_for(
        &self,
        resource_id: &str,
        resource_data: &serde_json::Value,
        options: &SessionOptions,
    ) -> Result<Vec<Source>, HandlerError> {
        match &self.source_builder {
            Some(builder) => builder(resource_id, resource_data, options),
            None => Ok(vec![Source::new(resource_id)]),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("source_builder", &self.source_builder.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Resolvers
// ============================================================================

/// Options passed to a resolver
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Report membership changes as they happen
    pub watch: bool,
    /// Target filter from the session options
    pub target: Option<String>,
    /// Resolver-specific knobs from the session options
    pub params: HashMap<String, String>,
}

/// Sources of a group resource
pub struct ResolvedSources {
    /// Sources present right now
    pub sources: Vec<Source>,
    /// Live membership changes, when watching is supported
    pub events: Option<BoxStream<'static, SourceEvent>>,
}

impl ResolvedSources {
    /// A fixed source set
    #[must_use]
    pub fn fixed(sources: Vec<Source>) -> Self {
        Self {
            sources,
            events: None,
        }
    }
}

impl fmt::Debug for ResolvedSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSources")
            .field("sources", &self.sources)
            .field("watching", &self.events.is_some())
            .finish()
    }
}

/// Expands a group resource into sources
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve the group's current sources, optionally with a change stream
    async fn resolve(
        &self,
        resource_data: &serde_json::Value,
        options: ResolveOptions,
    ) -> Result<ResolvedSources, HandlerError>;
}

// ============================================================================
// Registry
// ============================================================================

/// How a resource key is served
#[derive(Clone)]
pub enum Route {
    /// The handler materializes its own sources
    Direct(Handler),
    /// A resolver produces sources which the handler opens
    Resolved {
        /// Group resolver
        resolver: Arc<dyn SourceResolver>,
        /// Handler opening the resolved sources
        handler: Handler,
    },
}

impl Route {
    /// The handler that opens streams on this route
    #[must_use]
    pub fn handler(&self) -> &Handler {
        match self {
            Self::Direct(handler) | Self::Resolved { handler, .. } => handler,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(handler) => f.debug_tuple("Direct").field(handler).finish(),
            Self::Resolved { handler, .. } => f
                .debug_struct("Resolved")
                .field("handler", handler)
                .finish_non_exhaustive(),
        }
    }
}

/// Validated lookup table of routes
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    routes: HashMap<ResourceKey, Route>,
}

impl HandlerRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Route for a resource key
    #[must_use]
    pub fn route(&self, key: &ResourceKey) -> Option<&Route> {
        self.routes.get(key)
    }

    /// Registered keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<&ResourceKey> {
        let mut keys: Vec<_> = self.routes.keys().collect();
        keys.sort();
        keys
    }

    /// Number of registered keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

struct PendingResolver {
    key: ResourceKey,
    resolver: Arc<dyn SourceResolver>,
    handler_key: ResourceKey,
}

/// Collects registrations and validates them in [`build`](Self::build)
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: Vec<(ResourceKey, Handler)>,
    resolvers: Vec<PendingResolver>,
}

impl HandlerRegistryBuilder {
    /// Register a handler
    #[must_use]
    pub fn handler(mut self, key: impl Into<ResourceKey>, handler: Handler) -> Self {
        self.handlers.push((key.into(), handler));
        self
    }

    /// Register a resolver whose sources open through the handler at `handler_key`
    #[must_use]
    pub fn resolver(
        mut self,
        key: impl Into<ResourceKey>,
        resolver: impl SourceResolver + 'static,
        handler_key: impl Into<ResourceKey>,
    ) -> Self {
        self.resolvers.push(PendingResolver {
            key: key.into(),
            resolver: Arc::new(resolver),
            handler_key: handler_key.into(),
        });
        self
    }

    /// Validate and freeze the registry
    ///
    /// # Errors
    ///
    /// Fails if a key is registered twice or a resolver references a handler
    /// key with no handler.
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut routes = HashMap::new();
        let mut handlers: HashMap<ResourceKey, Handler> = HashMap::new();

        for (key, handler) in self.handlers {
            if handlers.contains_key(&key) {
                return Err(RegistryError::DuplicateKey(key));
            }
            handlers.insert(key.clone(), handler.clone());
            routes.insert(key, Route::Direct(handler));
        }

        for pending in self.resolvers {
            if routes.contains_key(&pending.key) {
                return Err(RegistryError::DuplicateKey(pending.key));
            }
            let Some(handler) = handlers.get(&pending.handler_key) else {
                return Err(RegistryError::UnknownStreamHandler {
                    resolver: pending.key,
                    handler: pending.handler_key,
                });
            };
            routes.insert(
                pending.key,
                Route::Resolved {
                    resolver: pending.resolver,
                    handler: handler.clone(),
                },
            );
        }

        Ok(HandlerRegistry { routes })
    }
}
