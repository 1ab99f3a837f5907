//! Session Manager
//!
//! The [`Manager`] owns the session table, the single bounded output channel
//! shared by every session and source, and the command loop that routes
//! [`StreamInput`]s to sessions.
//!
//! # Backpressure
//!
//! Producers block when the output channel is full. A consumer that stops
//! draining [`Manager::stream`] therefore throttles every session of the
//! manager, not just one.
//!
//! # Cancellation
//!
//! ```text
//!   root token (Manager)
//!     └── session token (one per session)
//!           └── source token (one per running source)
//! ```
//!
//! Cancelling a level cancels everything below it. Cancellation is idempotent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::messages::{SessionId, StreamCommand, StreamInput, StreamOutput};
use crate::orchestrator::ManagedSession;
use crate::registry::{HandlerRegistry, ResourceKey};
use crate::session::{Session, SessionOptions, SessionStatus};
use crate::streaming::Emitter;

/// Log Session Streaming Manager
///
/// Cheap to clone; clones share the same sessions and output channel. Dropping
/// the last clone cancels every session.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: Arc<HandlerRegistry>,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<SessionId, Arc<ManagedSession>>>,
    output_tx: mpsc::Sender<StreamOutput>,
    output_rx: Mutex<Option<mpsc::Receiver<StreamOutput>>>,
    root: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl Manager {
    /// Create a manager using the system clock
    #[must_use]
    pub fn new(registry: HandlerRegistry, config: ManagerConfig) -> Self {
        Self::with_clock(registry, config, Arc::new(SystemClock))
    }

    /// Create a manager with an injected clock
    #[must_use]
    pub fn with_clock(
        registry: HandlerRegistry,
        config: ManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel(config.output_capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                registry: Arc::new(registry),
                config,
                clock,
                sessions: RwLock::new(HashMap::new()),
                output_tx,
                output_rx: Mutex::new(Some(output_rx)),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Registered handlers and resolvers
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a session and start resolving its sources in the background
    ///
    /// Returns immediately with an `Active` session. An unknown resource key,
    /// a failing resolver or an empty source set are reported later as a
    /// `StreamError` event on the output stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_session(
        &self,
        resource_key: impl Into<ResourceKey>,
        resource_id: impl Into<String>,
        resource_data: serde_json::Value,
        options: SessionOptions,
    ) -> Session {
        let session = Session {
            id: SessionId::new(),
            resource_key: resource_key.into(),
            resource_id: resource_id.into(),
            options,
            status: SessionStatus::Active,
            active_sources: Vec::new(),
            created_at: self.inner.clock.now(),
        };

        let emitter = Emitter::new(
            session.id.clone(),
            self.inner.output_tx.clone(),
            Arc::clone(&self.inner.clock),
        );
        let managed = ManagedSession::new(
            session.clone(),
            resource_data,
            emitter,
            &self.inner.root,
            &self.inner.config,
        );

        self.inner
            .sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&managed));
        managed.start(Arc::clone(&self.inner.registry));

        info!(
            session_id = %session.id,
            resource_key = %session.resource_key,
            resource_id = %session.resource_id,
            follow = session.options.follow,
            "Session created"
        );
        session
    }

    /// Snapshot of one session
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::SessionNotFound`] for an unknown ID.
    pub fn get_session(&self, id: &SessionId) -> Result<Session, ManagerError> {
        self.lookup(id).map(|session| session.snapshot())
    }

    /// Snapshots of every tracked session, oldest first
    #[must_use]
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|session| session.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Number of tracked sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Replace a session's options
    ///
    /// A `params["enabled_sources"]` value is diffed against the running
    /// sources: disabled ones are cancelled, newly enabled ones are started.
    /// Other fields only affect streams opened afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::SessionNotFound`] for an unknown ID.
    pub fn update_session_options(
        &self,
        id: &SessionId,
        options: SessionOptions,
    ) -> Result<Session, ManagerError> {
        let session = self.lookup(id)?;
        Ok(session.update_options(options))
    }

    /// Stop forwarding lines of a session; readers keep reading and discard
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::SessionNotFound`] for an unknown ID.
    pub fn pause_session(&self, id: &SessionId) -> Result<Session, ManagerError> {
        let session = self.lookup(id)?.pause();
        debug!(session_id = %id, status = ?session.status, "Pause requested");
        Ok(session)
    }

    /// Resume forwarding lines of a paused session
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::SessionNotFound`] for an unknown ID.
    pub fn resume_session(&self, id: &SessionId) -> Result<Session, ManagerError> {
        let session = self.lookup(id)?.resume();
        debug!(session_id = %id, status = ?session.status, "Resume requested");
        Ok(session)
    }

    /// Remove a session, cancel it and wait for all of its tasks to exit
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::SessionNotFound`] for an unknown ID; nothing is
    /// changed in that case.
    pub async fn close_session(&self, id: &SessionId) -> Result<(), ManagerError> {
        let session = self
            .inner
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| ManagerError::SessionNotFound(id.clone()))?;

        session.close();
        session.closed().await;
        info!(session_id = %id, "Session closed");
        Ok(())
    }

    /// Cancel every session and wait for their tasks
    pub async fn shutdown(&self) {
        info!(sessions = self.session_count(), "Shutting down session manager");
        self.inner.root.cancel();
        self.close_all().await;
    }

    async fn close_all(&self) {
        let sessions: Vec<Arc<ManagedSession>> = self
            .inner
            .sessions
            .write()
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in &sessions {
            session.close();
        }
        for session in sessions {
            session.closed().await;
        }
    }

    fn lookup(&self, id: &SessionId) -> Result<Arc<ManagedSession>, ManagerError> {
        self.inner
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::SessionNotFound(id.clone()))
    }

    // ========================================================================
    // Stream Multiplexing
    // ========================================================================

    /// Attach the duplex stream shared by all sessions
    ///
    /// Spawns the command loop over `inputs` and returns the output stream.
    /// Commands for unknown sessions are logged and dropped. The loop ends
    /// when `inputs` ends or the manager shuts down; sessions keep streaming
    /// after `inputs` ends.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::OutputAlreadyTaken`] if called more than once.
    pub fn stream<S>(&self, inputs: S) -> Result<ReceiverStream<StreamOutput>, ManagerError>
    where
        S: Stream<Item = StreamInput> + Send + 'static,
    {
        let output = self
            .inner
            .output_rx
            .lock()
            .take()
            .ok_or(ManagerError::OutputAlreadyTaken)?;

        tokio::spawn(run_commands(
            Arc::downgrade(&self.inner),
            self.inner.root.clone(),
            inputs.boxed(),
        ));

        Ok(ReceiverStream::new(output))
    }

    async fn apply(&self, input: StreamInput) {
        let result = match input.command {
            StreamCommand::Pause => self.pause_session(&input.session_id).map(drop),
            StreamCommand::Resume => self.resume_session(&input.session_id).map(drop),
            StreamCommand::Close => self.close_session(&input.session_id).await,
        };

        if let Err(e) = result {
            warn!(
                session_id = %input.session_id,
                command = ?input.command,
                error = %e,
                "Dropping command"
            );
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("sessions", &self.session_count())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

async fn run_commands(
    inner: Weak<ManagerInner>,
    root: CancellationToken,
    mut inputs: futures::stream::BoxStream<'static, StreamInput>,
) {
    loop {
        let input = tokio::select! {
            biased;
            () = root.cancelled() => break,
            input = inputs.next() => input,
        };

        let Some(input) = input else {
            debug!("Command input ended");
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Manager { inner }.apply(input).await;
    }
}
