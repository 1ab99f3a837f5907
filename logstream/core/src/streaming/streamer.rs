//! Per-source reconnect loop
//!
//! ```text
//!   Connecting ──ok──► Streaming ──EOF, !follow──► Ended
//!       ▲  │                │
//!       │  err         EOF (follow) / error
//!       │  ▼                ▼
//!       └── backoff ◄── Reconnecting ──attempts exhausted──► Exhausted
//! ```
//!
//! Every open, read and backoff wait races the source's cancellation token.
//! Once cancelled, the loop returns without emitting anything else.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::{LineOrigin, StreamEventKind};
use crate::registry::{Handler, StreamRequest};

use super::backoff::ReconnectPolicy;
use super::emitter::Emitter;
use super::reader::{read_lines, ReadOutcome};

/// How a source's streaming task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    /// The stream finished and will not be retried
    Ended,
    /// Every allowed attempt failed
    Exhausted,
    /// The source or session was cancelled
    Cancelled,
}

/// Everything one source's streaming task needs
pub(crate) struct SourceStreamer {
    pub(crate) handler: Handler,
    pub(crate) request: StreamRequest,
    pub(crate) emitter: Arc<Emitter>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) max_line_bytes: usize,
    pub(crate) token: CancellationToken,
}

impl SourceStreamer {
    /// Run the reconnect loop
    ///
    /// `still_member` is consulted before every retry; a source that left the
    /// session is drained but never reopened.
    pub(crate) async fn run(self, still_member: impl Fn(&str) -> bool) -> StreamOutcome {
        let source_id = self.request.source.id.clone();

        if self.request.options.include_previous && !self.fetch_previous().await {
            return StreamOutcome::Cancelled;
        }

        let follow = self.request.options.follow;
        let mut failures = 0u32;

        loop {
            let opened = tokio::select! {
                biased;
                () = self.token.cancelled() => return StreamOutcome::Cancelled,
                opened = self.handler.open(&self.request) => opened,
            };

            let reason = match opened {
                Ok(stream) => {
                    if failures > 0 {
                        info!(
                            session_id = %self.emitter.session_id(),
                            source_id = %source_id,
                            attempt = failures + 1,
                            "Source reconnected"
                        );
                        let message = format!("reconnected after {failures} failed attempt(s)");
                        if !self.emit(StreamEventKind::Reconnected, message).await {
                            return StreamOutcome::Cancelled;
                        }
                    }

                    let outcome = read_lines(
                        stream,
                        &self.request.source,
                        LineOrigin::Current,
                        self.max_line_bytes,
                        &self.emitter,
                        &self.token,
                    )
                    .await;

                    match outcome {
                        ReadOutcome::Cancelled => return StreamOutcome::Cancelled,
                        ReadOutcome::Finished { lines, error } => {
                            if lines > 0 {
                                failures = 0;
                            }
                            match error {
                                None if !follow => {
                                    debug!(
                                        session_id = %self.emitter.session_id(),
                                        source_id = %source_id,
                                        lines,
                                        "Stream reached its end"
                                    );
                                    return self.finish("stream ended").await;
                                }
                                None => "stream closed".to_string(),
                                Some(error) => error,
                            }
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            if !still_member(&source_id) {
                debug!(
                    session_id = %self.emitter.session_id(),
                    source_id = %source_id,
                    "Source left the session, not retrying"
                );
                return self.finish("source removed").await;
            }

            failures += 1;
            if failures > self.policy.max_attempts {
                warn!(
                    session_id = %self.emitter.session_id(),
                    source_id = %source_id,
                    attempts = failures,
                    error = %reason,
                    "Giving up on source"
                );
                let message = format!("giving up after {failures} attempts: {reason}");
                return if self.emit(StreamEventKind::StreamError, message).await {
                    StreamOutcome::Exhausted
                } else {
                    StreamOutcome::Cancelled
                };
            }

            let backoff = self.policy.backoff.delay(failures);
            warn!(
                session_id = %self.emitter.session_id(),
                source_id = %source_id,
                attempt = failures,
                delay_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Source stream interrupted, reconnecting"
            );
            let message = format!(
                "retry {failures}/{} in {backoff:?}: {reason}",
                self.policy.max_attempts
            );
            if !self.emit(StreamEventKind::Reconnecting, message).await {
                return StreamOutcome::Cancelled;
            }

            tokio::select! {
                biased;
                () = self.token.cancelled() => return StreamOutcome::Cancelled,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One-shot fetch of the previous instance; `false` if cancelled
    async fn fetch_previous(&self) -> bool {
        let mut request = self.request.clone();
        request.previous = true;

        let opened = tokio::select! {
            biased;
            () = self.token.cancelled() => return false,
            opened = self.handler.open(&request) => opened,
        };

        match opened {
            Ok(stream) => {
                let outcome = read_lines(
                    stream,
                    &request.source,
                    LineOrigin::Previous,
                    self.max_line_bytes,
                    &self.emitter,
                    &self.token,
                )
                .await;
                match outcome {
                    ReadOutcome::Cancelled => false,
                    ReadOutcome::Finished { error: Some(e), .. } => {
                        warn!(
                            session_id = %self.emitter.session_id(),
                            source_id = %request.source.id,
                            error = %e,
                            "Previous logs ended abnormally"
                        );
                        true
                    }
                    ReadOutcome::Finished { error: None, .. } => true,
                }
            }
            Err(e) => {
                warn!(
                    session_id = %self.emitter.session_id(),
                    source_id = %request.source.id,
                    error = %e,
                    "Previous logs unavailable"
                );
                true
            }
        }
    }

    async fn emit(&self, kind: StreamEventKind, message: String) -> bool {
        self.emitter
            .event(&self.token, kind, Some(&self.request.source.id), message)
            .await
    }

    async fn finish(&self, message: &str) -> StreamOutcome {
        if self.emit(StreamEventKind::StreamEnded, message.to_string()).await {
            StreamOutcome::Ended
        } else {
            StreamOutcome::Cancelled
        }
    }
}
