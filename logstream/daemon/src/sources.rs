//! File-backed handler and directory resolver
//!
//! - [`FileOpener`] streams one local file. `tail_lines` and `limit_bytes`
//!   bound what is read; with `follow` the reader polls for appended data
//!   instead of ending at EOF. The "previous" stream is the rotated
//!   `<path>.1`.
//! - [`DirectoryResolver`] expands a directory into one source per `*.log`
//!   file and, when watching, polls the directory for files that appear or
//!   disappear.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use logstream_core::{
    HandlerError, LogStream, ResolveOptions, ResolvedSources, Source, SourceEvent, SourceResolver,
    StreamOpener, StreamRequest,
};

/// Source label holding the absolute file path
pub const PATH_LABEL: &str = "path";

/// Suffix of the rotated file served as previous logs
const ROTATED_SUFFIX: &str = ".1";

// ============================================================================
// File Handler
// ============================================================================

/// Opens local log files
#[derive(Clone, Debug)]
pub struct FileOpener {
    poll_interval: Duration,
}

impl FileOpener {
    /// Create an opener polling followed files at `poll_interval`
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for FileOpener {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

/// Path of the file behind a request
fn request_path(request: &StreamRequest) -> PathBuf {
    request
        .source
        .label(PATH_LABEL)
        .map_or_else(|| PathBuf::from(&request.source.id), PathBuf::from)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut rotated = path.as_os_str().to_os_string();
    rotated.push(ROTATED_SUFFIX);
    PathBuf::from(rotated)
}

#[async_trait]
impl StreamOpener for FileOpener {
    async fn open(&self, request: &StreamRequest) -> Result<LogStream, HandlerError> {
        let options = &request.options;
        let path = if request.previous {
            rotated_path(&request_path(request))
        } else {
            request_path(request)
        };

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| HandlerError::Open {
                source_id: request.source.id.clone(),
                message: format!("{}: {e}", path.display()),
            })?;

        if let Some(lines) = options.tail_lines {
            let offset = tail_offset(&mut file, lines).await?;
            file.seek(io::SeekFrom::Start(offset)).await?;
        }

        debug!(
            path = %path.display(),
            previous = request.previous,
            follow = options.follow,
            "Opened log file"
        );

        // Previous logs never grow, so they are never followed.
        let stream: LogStream = if options.follow && !request.previous {
            Box::pin(FollowReader::new(file, self.poll_interval))
        } else {
            Box::pin(file)
        };

        Ok(match options.limit_bytes {
            Some(limit) => Box::pin(stream.take(limit)),
            None => stream,
        })
    }
}

/// Block size of the backwards scan for the tail offset
const TAIL_CHUNK: u64 = 8 * 1024;

/// Byte offset where the last `lines` lines of `file` start
///
/// Scans backwards from the end in fixed-size blocks. A final newline does
/// not start an empty last line.
async fn tail_offset(file: &mut tokio::fs::File, lines: u64) -> io::Result<u64> {
    let len = file.metadata().await?.len();
    if lines == 0 {
        return Ok(len);
    }

    let mut remaining = lines;
    let mut end = len;
    let mut block = Vec::new();
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        block.clear();
        file.seek(io::SeekFrom::Start(start)).await?;
        (&mut *file).take(end - start).read_to_end(&mut block).await?;

        for (i, byte) in block.iter().enumerate().rev() {
            let pos = start + i as u64;
            if *byte == b'\n' && pos + 1 != len {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(pos + 1);
                }
            }
        }
        end = start;
    }
    Ok(0)
}

/// Reads a file and keeps polling for appended data at EOF
struct FollowReader {
    file: tokio::fs::File,
    interval: Interval,
}

impl FollowReader {
    fn new(file: tokio::fs::File, poll_interval: Duration) -> Self {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { file, interval }
    }
}

impl AsyncRead for FollowReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let before = buf.filled().len();
            ready!(Pin::new(&mut self.file).poll_read(cx, buf))?;
            if buf.filled().len() > before || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            ready!(self.interval.poll_tick(cx));
        }
    }
}

// ============================================================================
// Directory Resolver
// ============================================================================

/// Expands a directory into its `*.log` files
///
/// The directory comes from `resource_data["path"]`.
#[derive(Clone, Debug)]
pub struct DirectoryResolver {
    poll_interval: Duration,
}

impl DirectoryResolver {
    /// Create a resolver polling watched directories at `poll_interval`
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for DirectoryResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Current `*.log` files of `dir` keyed by file name
async fn list_logs(dir: &Path, target: Option<&str>) -> io::Result<BTreeMap<String, Source>> {
    let mut found = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if target.is_some_and(|t| t != name && t != stem) {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let source = Source::new(name.clone())
            .with_label(PATH_LABEL, path.to_string_lossy())
            .with_label("dir", dir.to_string_lossy());
        found.insert(name, source);
    }
    Ok(found)
}

/// Membership changes between two listings
fn diff_listings(
    before: &BTreeMap<String, Source>,
    after: &BTreeMap<String, Source>,
) -> Vec<SourceEvent> {
    let removed = before
        .iter()
        .filter(|(name, _)| !after.contains_key(*name))
        .map(|(_, source)| SourceEvent::Removed(source.clone()));
    let added = after
        .iter()
        .filter(|(name, _)| !before.contains_key(*name))
        .map(|(_, source)| SourceEvent::Added(source.clone()));
    removed.chain(added).collect()
}

struct WatchState {
    dir: PathBuf,
    target: Option<String>,
    known: BTreeMap<String, Source>,
    interval: Interval,
}

#[async_trait]
impl SourceResolver for DirectoryResolver {
    async fn resolve(
        &self,
        resource_data: &serde_json::Value,
        options: ResolveOptions,
    ) -> Result<ResolvedSources, HandlerError> {
        let dir = resource_data
            .get("path")
            .and_then(serde_json::Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| HandlerError::Resolve("resource data has no \"path\"".to_string()))?;

        let known = list_logs(&dir, options.target.as_deref())
            .await
            .map_err(|e| HandlerError::Resolve(format!("{}: {e}", dir.display())))?;
        let sources: Vec<Source> = known.values().cloned().collect();

        if !options.watch {
            return Ok(ResolvedSources::fixed(sources));
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.reset();

        let state = WatchState {
            dir,
            target: options.target,
            known,
            interval,
        };
        let events = futures::stream::unfold(state, |mut state| async move {
            loop {
                state.interval.tick().await;
                match list_logs(&state.dir, state.target.as_deref()).await {
                    Ok(current) => {
                        let events = diff_listings(&state.known, &current);
                        state.known = current;
                        if !events.is_empty() {
                            return Some((events, state));
                        }
                    }
                    Err(e) => {
                        warn!(dir = %state.dir.display(), error = %e, "Failed to list directory");
                    }
                }
            }
        })
        .flat_map(futures::stream::iter)
        .boxed();

        Ok(ResolvedSources {
            sources,
            events: Some(events),
        })
    }
}
