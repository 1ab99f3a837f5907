//! Per-session handle onto the shared output channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::messages::{Line, LineOrigin, SessionId, StreamEvent, StreamEventKind, StreamOutput};
use crate::source::Source;

use super::reader::extract_timestamp;

/// Tags output with one session ID and pushes it onto the shared channel
///
/// Every send races the caller's cancellation token, so a producer blocked on
/// a full channel stops as soon as its source or session is cancelled.
pub(crate) struct Emitter {
    session_id: SessionId,
    tx: mpsc::Sender<StreamOutput>,
    clock: Arc<dyn Clock>,
    paused: AtomicBool,
    discarded: AtomicU64,
}

impl Emitter {
    pub(crate) fn new(
        session_id: SessionId,
        tx: mpsc::Sender<StreamOutput>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session_id,
            tx,
            clock,
            paused: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }

    pub(crate) fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Lines discarded while paused since the last call
    pub(crate) fn take_discarded(&self) -> u64 {
        self.discarded.swap(0, Ordering::SeqCst)
    }

    /// Send one output; `false` once cancelled or the consumer is gone
    async fn send(&self, token: &CancellationToken, output: StreamOutput) -> bool {
        tokio::select! {
            biased;
            () = token.cancelled() => false,
            sent = self.tx.send(output) => sent.is_ok(),
        }
    }

    /// Forward one raw line of a source, or count it while paused
    pub(crate) async fn source_line(
        &self,
        token: &CancellationToken,
        source: &Source,
        raw: &str,
        origin: LineOrigin,
    ) -> bool {
        if self.is_paused() {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            return !token.is_cancelled();
        }

        let (timestamp, content) = extract_timestamp(raw, self.clock.now());
        let line = Line {
            session_id: self.session_id.clone(),
            source_id: source.id.clone(),
            labels: source.labels.clone(),
            timestamp,
            content: content.to_string(),
            origin,
        };
        self.send(token, StreamOutput::line(line)).await
    }

    /// Synthesized line not tied to any source
    pub(crate) async fn system_line(&self, token: &CancellationToken, content: String) -> bool {
        let line = Line {
            session_id: self.session_id.clone(),
            source_id: String::new(),
            labels: HashMap::new(),
            timestamp: self.clock.now(),
            content,
            origin: LineOrigin::System,
        };
        self.send(token, StreamOutput::line(line)).await
    }

    /// Lifecycle event; `source_id = None` for session-level events
    pub(crate) async fn event(
        &self,
        token: &CancellationToken,
        kind: StreamEventKind,
        source_id: Option<&str>,
        message: impl Into<String>,
    ) -> bool {
        let event = StreamEvent {
            kind,
            source_id: source_id.map(ToString::to_string),
            message: message.into(),
            timestamp: self.clock.now(),
        };
        self.send(token, StreamOutput::event(self.session_id.clone(), event))
            .await
    }
}
