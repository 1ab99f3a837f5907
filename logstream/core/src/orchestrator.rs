//! Session Orchestrator
//!
//! Owns the task tree of one session:
//!
//! ```text
//!   session token ─┬─ resolution task ──► fan-out
//!                  ├─ source token ── source task (permit) ── reconnect loop
//!                  ├─ source token ── source task (permit) ── reconnect loop
//!                  └─ membership watcher (resolver events)
//! ```
//!
//! All tasks are spawned on the session's `TaskTracker`, so closing a session
//! can wait for every one of them. The source map holds exactly the sources
//! whose task is running; each entry carries a generation so a task that was
//! cancelled and replaced cannot remove its successor's entry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::messages::StreamEventKind;
use crate::registry::{Handler, HandlerRegistry, ResolveOptions, Route, StreamRequest};
use crate::session::{Session, SessionOptions, SessionStatus};
use crate::source::{Source, SourceEvent};
use crate::streaming::{Emitter, ReconnectPolicy, SourceStreamer, StreamOutcome};

struct SourceSlot {
    token: CancellationToken,
    generation: u64,
}

struct SessionState {
    session: Session,
    /// Every source resolved for the session, enabled or not
    known: Vec<Source>,
    running: HashMap<String, SourceSlot>,
    next_generation: u64,
    watcher_running: bool,
}

/// Live state of one session
pub(crate) struct ManagedSession {
    state: Mutex<SessionState>,
    resource_data: serde_json::Value,
    emitter: Arc<Emitter>,
    token: CancellationToken,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    handler: OnceLock<Handler>,
    policy: ReconnectPolicy,
    max_line_bytes: usize,
}

impl ManagedSession {
    pub(crate) fn new(
        session: Session,
        resource_data: serde_json::Value,
        emitter: Emitter,
        parent: &CancellationToken,
        config: &ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                session,
                known: Vec::new(),
                running: HashMap::new(),
                next_generation: 0,
                watcher_running: false,
            }),
            resource_data,
            emitter: Arc::new(emitter),
            token: parent.child_token(),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_streams_per_session.max(1))),
            handler: OnceLock::new(),
            policy: config.reconnect_policy(),
            max_line_bytes: config.max_line_bytes,
        })
    }

    pub(crate) fn snapshot(&self) -> Session {
        self.state.lock().session.clone()
    }

    // ========================================================================
    // Resolution & Fan-out
    // ========================================================================

    /// Resolve sources in the background and fan out
    pub(crate) fn start(self: &Arc<Self>, registry: Arc<HandlerRegistry>) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.resolve(&registry).await });
    }

    async fn resolve(self: Arc<Self>, registry: &HandlerRegistry) {
        let (key, resource_id, options) = {
            let state = self.state.lock();
            (
                state.session.resource_key.clone(),
                state.session.resource_id.clone(),
                state.session.options.clone(),
            )
        };

        let Some(route) = registry.route(&key).cloned() else {
            self.fail(format!(
                "no handler or resolver registered for resource key {key}"
            ))
            .await;
            return;
        };
        let handler = route.handler().clone();

        let (sources, events) = match route {
            Route::Direct(direct) => {
                match direct.sources_for(&resource_id, &self.resource_data, &options) {
                    Ok(sources) => (sources, None),
                    Err(e) => {
                        self.fail(format!("failed to build sources: {e}")).await;
                        return;
                    }
                }
            }
            Route::Resolved { resolver, .. } => {
                let resolve_options = ResolveOptions {
                    watch: options.follow,
                    target: options.target.clone(),
                    params: options.params.clone(),
                };
                let resolved = tokio::select! {
                    biased;
                    () = self.token.cancelled() => return,
                    resolved = resolver.resolve(&self.resource_data, resolve_options) => resolved,
                };
                match resolved {
                    Ok(resolved) => (
                        resolved.sources,
                        resolved.events.filter(|_| options.follow),
                    ),
                    Err(e) => {
                        self.fail(e.to_string()).await;
                        return;
                    }
                }
            }
        };

        if sources.is_empty() {
            self.fail(format!("resource {resource_id} has no log sources"))
                .await;
            return;
        }

        // Resolution runs once per session.
        let _ = self.handler.set(handler);
        self.fan_out(sources, events);
    }

    /// Terminal configuration or resolution failure
    async fn fail(&self, message: String) {
        {
            let mut state = self.state.lock();
            if state.session.status.is_terminal() {
                return;
            }
            state.session.status = SessionStatus::Error;
        }
        warn!(
            session_id = %self.emitter.session_id(),
            error = %message,
            "Session failed to start"
        );
        self.emitter
            .event(&self.token, StreamEventKind::StreamError, None, message)
            .await;
    }

    fn fan_out(
        self: &Arc<Self>,
        sources: Vec<Source>,
        events: Option<BoxStream<'static, SourceEvent>>,
    ) {
        let watching = events.is_some();
        let selected = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.session.status.is_terminal() {
                return;
            }
            let selected: Vec<Source> = sources
                .iter()
                .filter(|s| state.session.options.is_source_enabled(&s.id))
                .cloned()
                .collect();
            state.session.active_sources.clone_from(&selected);
            state.known = sources;
            state.watcher_running = watching;
            selected
        };

        info!(
            session_id = %self.emitter.session_id(),
            sources = selected.len(),
            watching,
            "Fanning out to sources"
        );

        // Nothing will ever stream unless the options change
        if selected.is_empty() && !watching {
            warn!(
                session_id = %self.emitter.session_id(),
                "No resolved source is enabled"
            );
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                this.emitter
                    .event(
                        &this.token,
                        StreamEventKind::StreamEnded,
                        None,
                        "no enabled sources",
                    )
                    .await;
            });
        }

        for source in selected {
            self.spawn_source(source, false);
        }

        if let Some(events) = events {
            let this = Arc::clone(self);
            self.tracker.spawn(async move { this.watch(events).await });
        }
    }

    /// Start the streaming task of one source unless one is already running
    fn spawn_source(self: &Arc<Self>, source: Source, announce: bool) {
        let Some(handler) = self.handler.get().cloned() else {
            return;
        };

        let (token, generation, options, resource_id) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.running.contains_key(&source.id) {
                debug!(
                    session_id = %self.emitter.session_id(),
                    source_id = %source.id,
                    "Source already streaming"
                );
                return;
            }
            let token = self.token.child_token();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.running.insert(
                source.id.clone(),
                SourceSlot {
                    token: token.clone(),
                    generation,
                },
            );
            (
                token,
                generation,
                state.session.options.clone(),
                state.session.resource_id.clone(),
            )
        };

        let announce = announce && options.include_source_events;
        let source_id = source.id.clone();
        let streamer = SourceStreamer {
            handler,
            request: StreamRequest {
                source,
                resource_id,
                resource_data: self.resource_data.clone(),
                options,
                previous: false,
            },
            emitter: Arc::clone(&self.emitter),
            policy: self.policy,
            max_line_bytes: self.max_line_bytes,
            token,
        };

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let outcome = this.run_source(streamer, announce).await;
            this.source_finished(&source_id, generation, outcome);
        });
    }

    async fn run_source(&self, streamer: SourceStreamer, announce: bool) -> StreamOutcome {
        let source_id = streamer.request.source.id.clone();

        if announce
            && !self
                .emitter
                .event(
                    &streamer.token,
                    StreamEventKind::SourceAdded,
                    Some(&source_id),
                    "source added",
                )
                .await
        {
            return StreamOutcome::Cancelled;
        }

        let permit = tokio::select! {
            biased;
            () = streamer.token.cancelled() => return StreamOutcome::Cancelled,
            permit = Arc::clone(&self.permits).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return StreamOutcome::Cancelled;
        };

        debug!(
            session_id = %self.emitter.session_id(),
            source_id = %source_id,
            "Source stream starting"
        );
        streamer.run(|id| self.is_member(id)).await
    }

    fn is_member(&self, source_id: &str) -> bool {
        self.state
            .lock()
            .session
            .active_sources
            .iter()
            .any(|s| s.id == source_id)
    }

    fn source_finished(&self, source_id: &str, generation: u64, outcome: StreamOutcome) {
        let mut state = self.state.lock();
        if state
            .running
            .get(source_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            state.running.remove(source_id);
        }

        debug!(
            session_id = %self.emitter.session_id(),
            source_id = %source_id,
            ?outcome,
            "Source task finished"
        );

        if outcome == StreamOutcome::Exhausted
            && state.running.is_empty()
            && !state.watcher_running
            && !state.session.status.is_terminal()
        {
            state.session.status = SessionStatus::Error;
            warn!(
                session_id = %self.emitter.session_id(),
                "Last source exhausted its reconnect attempts"
            );
        }
    }

    // ========================================================================
    // Dynamic Membership
    // ========================================================================

    async fn watch(self: Arc<Self>, mut events: BoxStream<'static, SourceEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                event = events.next() => event,
            };

            match event {
                Some(SourceEvent::Added(source)) => self.source_added(source),
                Some(SourceEvent::Removed(source)) => {
                    if !self.source_removed(&source).await {
                        break;
                    }
                }
                None => break,
            }
        }

        self.state.lock().watcher_running = false;
        debug!(
            session_id = %self.emitter.session_id(),
            "Source watcher stopped"
        );
    }

    fn source_added(self: &Arc<Self>, source: Source) {
        let (enabled, rejoined) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.known.iter().any(|s| s.id == source.id) {
                state.known.push(source.clone());
            }
            let enabled = state.session.options.is_source_enabled(&source.id);
            let newly_active =
                enabled && !state.session.active_sources.iter().any(|s| s.id == source.id);
            if newly_active {
                state.session.active_sources.push(source.clone());
            }
            // A removed source whose reader is still draining keeps its task
            let rejoined = newly_active
                && state.running.contains_key(&source.id)
                && state.session.options.include_source_events;
            (enabled, rejoined)
        };

        info!(
            session_id = %self.emitter.session_id(),
            source_id = %source.id,
            enabled,
            rejoined,
            "Source joined"
        );
        if rejoined {
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                this.emitter
                    .event(
                        &this.token,
                        StreamEventKind::SourceAdded,
                        Some(&source.id),
                        "source added",
                    )
                    .await;
            });
        } else if enabled {
            self.spawn_source(source, true);
        }
    }

    /// The reader of a departed source keeps running until its stream ends
    async fn source_removed(&self, source: &Source) -> bool {
        let (was_active, announce) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.known.retain(|s| s.id != source.id);
            let before = state.session.active_sources.len();
            state.session.active_sources.retain(|s| s.id != source.id);
            (
                state.session.active_sources.len() != before,
                state.session.options.include_source_events,
            )
        };

        info!(
            session_id = %self.emitter.session_id(),
            source_id = %source.id,
            "Source left"
        );
        if was_active && announce {
            return self
                .emitter
                .event(
                    &self.token,
                    StreamEventKind::SourceRemoved,
                    Some(&source.id),
                    "source removed",
                )
                .await;
        }
        true
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Store new options and apply an `enabled_sources` change
    pub(crate) fn update_options(self: &Arc<Self>, options: SessionOptions) -> Session {
        let requested = options.enabled_sources();
        let resolved = self.handler.get().is_some();

        let (disabled, enabled, snapshot) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let previous = std::mem::replace(&mut state.session.options, options);
            let mut disabled = Vec::new();
            let mut enabled = Vec::new();

            if let (Some(wanted), true) = (requested, resolved) {
                let stale: Vec<String> = state
                    .running
                    .keys()
                    .filter(|id| !wanted.contains(id))
                    .cloned()
                    .collect();
                for id in stale {
                    if let Some(slot) = state.running.remove(&id) {
                        slot.token.cancel();
                    }
                    disabled.push(id);
                }
                state.session.active_sources.retain(|s| wanted.contains(&s.id));

                for source in &state.known {
                    if wanted.contains(&source.id)
                        && !previous.is_source_enabled(&source.id)
                        && !state.running.contains_key(&source.id)
                    {
                        enabled.push(source.clone());
                    }
                }
                for source in &enabled {
                    if !state.session.active_sources.iter().any(|s| s.id == source.id) {
                        state.session.active_sources.push(source.clone());
                    }
                }
            }

            (disabled, enabled, state.session.clone())
        };

        info!(
            session_id = %snapshot.id,
            disabled = disabled.len(),
            enabled = enabled.len(),
            "Session options updated"
        );

        if !disabled.is_empty() && snapshot.options.include_source_events {
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                for source_id in disabled {
                    let sent = this
                        .emitter
                        .event(
                            &this.token,
                            StreamEventKind::SourceRemoved,
                            Some(&source_id),
                            "source disabled",
                        )
                        .await;
                    if !sent {
                        break;
                    }
                }
            });
        }

        for source in enabled {
            self.spawn_source(source, true);
        }

        self.snapshot()
    }

    pub(crate) fn pause(&self) -> Session {
        let mut state = self.state.lock();
        if state.session.status == SessionStatus::Active {
            state.session.status = SessionStatus::Paused;
            self.emitter.set_paused(true);
        }
        state.session.clone()
    }

    pub(crate) fn resume(self: &Arc<Self>) -> Session {
        let snapshot = {
            let mut state = self.state.lock();
            if state.session.status == SessionStatus::Paused {
                state.session.status = SessionStatus::Active;
                self.emitter.set_paused(false);
            }
            state.session.clone()
        };

        let discarded = self.emitter.take_discarded();
        if discarded > 0 {
            debug!(
                session_id = %snapshot.id,
                discarded,
                "Lines discarded while paused"
            );
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                this.emitter
                    .system_line(
                        &this.token,
                        format!("{discarded} line(s) discarded while paused"),
                    )
                    .await;
            });
        }
        snapshot
    }

    /// Cancel every task of the session; pair with [`closed`](Self::closed)
    pub(crate) fn close(&self) {
        self.token.cancel();
        {
            let mut state = self.state.lock();
            state.session.status = SessionStatus::Closed;
            state.running.clear();
        }
        self.tracker.close();
    }

    /// Wait until every task of the session has exited
    pub(crate) async fn closed(&self) {
        self.tracker.wait().await;
    }
}
