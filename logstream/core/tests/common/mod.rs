//! Shared fixtures for manager integration tests
//!
//! [`Recorder`] scripts what each source's stream does and records every open
//! plus how many streams are alive at once.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use logstream_core::{
    Handler, HandlerError, HandlerRegistry, LogStream, Manager, ManagerConfig, ResolveOptions,
    ResolvedSources, Source, SourceEvent, SourceResolver, StreamEventKind, StreamInput,
    StreamOpener, StreamOutput, StreamRequest,
};

/// What one open of a source does
pub enum Script {
    /// Yield these lines, then EOF
    Lines(Vec<&'static str>),
    /// Fail the open
    Fail(&'static str),
    /// Stay open without producing anything
    Hold,
    /// Read from a pipe the test writes to
    Pipe(DuplexStream),
}

/// Scripts opens and records what happened
pub struct Recorder {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    hold_by_default: bool,
    opens: Mutex<Vec<(String, Instant)>>,
    held_writers: Mutex<Vec<DuplexStream>>,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    /// Unscripted opens fail
    pub fn failing() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    /// Unscripted opens stay open forever
    pub fn holding() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    fn new(hold_by_default: bool) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            hold_by_default,
            opens: Mutex::new(Vec::new()),
            held_writers: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, source_id: &str, script: Script) {
        self.scripts
            .lock()
            .entry(source_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn opens_for(&self, source_id: &str) -> Vec<Instant> {
        self.opens
            .lock()
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn track(self: &Arc<Self>, inner: impl AsyncRead + Send + Unpin + 'static) -> LogStream {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Box::pin(Tracked {
            inner: Box::new(inner),
            recorder: Arc::clone(self),
        })
    }

    fn open(self: &Arc<Self>, request: &StreamRequest) -> Result<LogStream, HandlerError> {
        let source_id = request.source.id.clone();
        self.opens.lock().push((source_id.clone(), Instant::now()));

        let script = self
            .scripts
            .lock()
            .get_mut(&source_id)
            .and_then(VecDeque::pop_front);
        let script = match script {
            Some(script) => script,
            None if self.hold_by_default => Script::Hold,
            None => Script::Fail("connection refused"),
        };

        match script {
            Script::Lines(lines) => {
                let mut bytes = lines.join("\n").into_bytes();
                bytes.push(b'\n');
                Ok(self.track(io::Cursor::new(bytes)))
            }
            Script::Fail(message) => Err(HandlerError::Open {
                source_id,
                message: message.to_string(),
            }),
            Script::Hold => {
                let (writer, reader) = tokio::io::duplex(64);
                self.held_writers.lock().push(writer);
                Ok(self.track(reader))
            }
            Script::Pipe(reader) => Ok(self.track(reader)),
        }
    }
}

struct Tracked {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    recorder: Arc<Recorder>,
}

impl AsyncRead for Tracked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.recorder.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opener backed by a [`Recorder`]
pub struct ScriptedOpener(pub Arc<Recorder>);

#[async_trait]
impl StreamOpener for ScriptedOpener {
    async fn open(&self, request: &StreamRequest) -> Result<LogStream, HandlerError> {
        self.0.open(request)
    }
}

/// Resolver with a fixed source list and a test-driven event channel
pub struct ChannelResolver {
    sources: Vec<Source>,
    events: Mutex<Option<mpsc::Receiver<SourceEvent>>>,
}

impl ChannelResolver {
    pub fn new(sources: Vec<Source>) -> (Self, mpsc::Sender<SourceEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                sources,
                events: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl SourceResolver for ChannelResolver {
    async fn resolve(
        &self,
        _resource_data: &serde_json::Value,
        options: ResolveOptions,
    ) -> Result<ResolvedSources, HandlerError> {
        let events = if options.watch {
            self.events
                .lock()
                .take()
                .map(|rx| ReceiverStream::new(rx).boxed())
        } else {
            None
        };
        Ok(ResolvedSources {
            sources: self.sources.clone(),
            events,
        })
    }
}

/// A manager with its output stream and command sender
pub struct Harness {
    pub manager: Manager,
    pub output: ReceiverStream<StreamOutput>,
    pub commands: mpsc::Sender<StreamInput>,
}

impl Harness {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, ManagerConfig::default())
    }

    pub fn with_config(registry: HandlerRegistry, config: ManagerConfig) -> Self {
        init_tracing();
        let manager = Manager::new(registry, config);
        let (commands, rx) = mpsc::channel(16);
        let output = manager.stream(ReceiverStream::new(rx)).unwrap();
        Self {
            manager,
            output,
            commands,
        }
    }

    /// Next output, failing the test if none arrives
    pub async fn next(&mut self) -> StreamOutput {
        tokio::time::timeout(Duration::from_secs(60), self.output.next())
            .await
            .expect("timed out waiting for output")
            .expect("output stream ended")
    }

    /// Outputs up to and including the first event of `kind`
    pub async fn until_event(&mut self, kind: StreamEventKind) -> Vec<StreamOutput> {
        let mut seen = Vec::new();
        loop {
            let out = self.next().await;
            let done = out.as_event().is_some_and(|e| e.kind == kind);
            seen.push(out);
            if done {
                return seen;
            }
        }
    }

    /// Assert nothing is emitted for a while
    pub async fn assert_quiet(&mut self, wait: Duration) {
        if let Ok(Some(out)) = tokio::time::timeout(wait, self.output.next()).await {
            panic!("unexpected output: {out:?}");
        }
    }
}

/// Registry with a single handler under `file`
pub fn file_registry(recorder: &Arc<Recorder>) -> HandlerRegistry {
    HandlerRegistry::builder()
        .handler("file", Handler::new(ScriptedOpener(Arc::clone(recorder))))
        .build()
        .unwrap()
}

/// Registry whose `pod` handler yields the given container sources
pub fn pod_registry(recorder: &Arc<Recorder>, containers: &[&str]) -> HandlerRegistry {
    let containers: Vec<String> = containers.iter().map(ToString::to_string).collect();
    let handler = Handler::new(ScriptedOpener(Arc::clone(recorder))).with_source_builder(
        move |pod, _, _| {
            Ok(containers
                .iter()
                .map(|c| Source::new(c.clone()).with_label("pod", pod))
                .collect())
        },
    );
    HandlerRegistry::builder()
        .handler("pod", handler)
        .build()
        .unwrap()
}

pub fn event_kinds(outputs: &[StreamOutput]) -> Vec<StreamEventKind> {
    outputs
        .iter()
        .filter_map(|o| o.as_event().map(|e| e.kind))
        .collect()
}

pub fn line_contents(outputs: &[StreamOutput]) -> Vec<String> {
    outputs
        .iter()
        .filter_map(|o| o.as_line().map(|l| l.content.clone()))
        .collect()
}

/// Poll `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
