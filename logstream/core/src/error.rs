//! Error Types
//!
//! Errors surfaced synchronously by the manager and by plugin collaborators.
//! Stream failures never reach the caller as `Err`: they travel on the output
//! channel as [`StreamEvent`](crate::messages::StreamEvent)s instead.

use thiserror::Error;

use crate::messages::SessionId;
use crate::registry::ResourceKey;

/// Errors returned by [`Manager`](crate::Manager) operations
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No session with this ID is tracked
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The shared output stream was already handed to a consumer
    #[error("output stream already taken; only one consumer may call stream()")]
    OutputAlreadyTaken,
}

/// Errors produced by handlers, source builders and resolvers
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The byte stream for a source could not be opened
    #[error("failed to open stream for source {source_id}: {message}")]
    Open {
        /// Source the open was attempted for
        source_id: String,
        /// Description of the failure
        message: String,
    },

    /// Resolving a group resource into sources failed
    #[error("failed to resolve sources: {0}")]
    Resolve(String),

    /// The handler does not support the requested mode (e.g. previous logs)
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// IO error from the underlying stream
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors detected while building a [`HandlerRegistry`](crate::HandlerRegistry)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The same resource key was registered twice
    #[error("resource key registered more than once: {0}")]
    DuplicateKey(ResourceKey),

    /// A resolver points at a handler key that has no handler
    #[error("resolver {resolver} streams through unregistered handler {handler}")]
    UnknownStreamHandler {
        /// Key of the resolver
        resolver: ResourceKey,
        /// Handler key it references
        handler: ResourceKey,
    },
}
