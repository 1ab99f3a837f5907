//! JSON-lines bridge between stdio and the manager
//!
//! Each stdin line is one [`StreamInput`] (`{"session_id": "...", "command": "pause"}`).
//! Each [`StreamOutput`] is written to stdout as one JSON line.

use std::collections::{HashMap, HashSet};

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use logstream_core::{Manager, SessionId, StreamEventKind, StreamInput, StreamOutput};

/// Errors while forwarding output
#[derive(Debug, Error)]
pub enum ServerError {
    /// Writing to the output failed
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),

    /// An output could not be encoded
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Parse newline-delimited commands from `reader`
///
/// Blank lines are skipped and malformed lines are logged and dropped. The
/// stream ends at EOF or on the first read error.
pub fn command_stream<R>(reader: R) -> impl Stream<Item = StreamInput> + Send + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    LinesStream::new(BufReader::new(reader).lines())
        .take_while(|line| {
            if let Err(e) = line {
                warn!(error = %e, "Failed to read command input");
            }
            futures::future::ready(line.is_ok())
        })
        .filter_map(|line| async move {
            let line = line.ok()?;
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match serde_json::from_str::<StreamInput>(line) {
                Ok(input) => Some(input),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed command");
                    None
                }
            }
        })
}

/// Tracks when every session of a one-shot run has finished
///
/// A session is finished once it ended or failed as a whole, or every one of
/// its active sources reported `StreamEnded` or `StreamError`.
pub struct Completion {
    manager: Manager,
    sessions: Vec<SessionId>,
    finished: HashMap<SessionId, HashSet<String>>,
    settled: HashSet<SessionId>,
}

impl Completion {
    /// Watch `sessions` of `manager`
    #[must_use]
    pub fn new(manager: Manager, sessions: Vec<SessionId>) -> Self {
        Self {
            manager,
            sessions,
            finished: HashMap::new(),
            settled: HashSet::new(),
        }
    }

    /// Record an output; returns true once everything has finished
    pub fn observe(&mut self, output: &StreamOutput) -> bool {
        let Some(event) = output.as_event() else {
            return false;
        };
        match (event.kind, &event.source_id) {
            (StreamEventKind::StreamEnded | StreamEventKind::StreamError, None) => {
                self.settled.insert(output.session_id.clone());
            }
            (StreamEventKind::StreamEnded | StreamEventKind::StreamError, Some(id)) => {
                self.finished
                    .entry(output.session_id.clone())
                    .or_default()
                    .insert(id.clone());
            }
            _ => return false,
        }
        self.is_done()
    }

    fn is_done(&self) -> bool {
        self.sessions.iter().all(|id| {
            if self.settled.contains(id) {
                return true;
            }
            let Ok(session) = self.manager.get_session(id) else {
                return true;
            };
            let finished = self.finished.get(id);
            !session.active_sources.is_empty()
                && session
                    .active_sources
                    .iter()
                    .all(|s| finished.is_some_and(|f| f.contains(&s.id)))
        })
    }
}

/// Write every output to `writer` as a JSON line
///
/// Returns when the output stream ends or, with a [`Completion`], once every
/// watched session has finished.
///
/// # Errors
///
/// Returns [`ServerError`] if encoding or writing fails.
pub async fn forward<S, W>(
    mut outputs: S,
    mut writer: W,
    mut completion: Option<Completion>,
) -> Result<(), ServerError>
where
    S: Stream<Item = StreamOutput> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(output) = outputs.next().await {
        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;

        if completion.as_mut().is_some_and(|c| c.observe(&output)) {
            info!("All sources finished");
            return Ok(());
        }
    }

    debug!("Output stream ended");
    Ok(())
}
