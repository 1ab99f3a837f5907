//! Logstream Core - Multiplexed Log Session Streaming
//!
//! This crate opens, multiplexes and keeps alive log tail streams for one or
//! many *sources* (containers of a pod, shards of a distributed resource, files
//! in a directory) and exposes them to a caller as a single ordered, resumable
//! stream of [`StreamOutput`] values.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Manager                              │
//! │   sessions table         shared output channel (bounded, 256)    │
//! │        │                              ▲                          │
//! │        ▼                              │ StreamOutput{session_id} │
//! │  ┌────────────────────┐               │                          │
//! │  │ Session            │  resolve ──► fan-out (semaphore of 20)   │
//! │  │  orchestrator      │                 │        │        │      │
//! │  │  + source watcher  │            ┌────▼──┐ ┌───▼───┐ ┌──▼────┐ │
//! │  └────────────────────┘            │source │ │source │ │source │ │
//! │                                    │stream │ │stream │ │stream │ │
//! │   StreamInput (pause/resume/close) └───────┘ └───────┘ └───────┘ │
//! │        ──► command multiplexer       reconnect-with-backoff      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Manager`]: owns the session table, the output channel and the command loop
//! - [`HandlerRegistry`]: typed lookup of [`Handler`]s and [`SourceResolver`]s
//! - [`Session`]: snapshot of one logical viewing session
//! - [`StreamOutput`] / [`StreamInput`]: the units flowing out of and into the manager
//!
//! # Quick Start
//!
//! ```ignore
//! use logstream_core::{Handler, HandlerRegistry, Manager, ManagerConfig, SessionOptions};
//!
//! let registry = HandlerRegistry::builder()
//!     .handler("file", Handler::new(FileOpener::default()))
//!     .build()?;
//! let manager = Manager::new(registry, ManagerConfig::default());
//!
//! let mut output = manager.stream(futures::stream::pending())?;
//! let session = manager.create_session("file", "/var/log/app.log", json!({}), SessionOptions::default());
//!
//! while let Some(out) = output.next().await {
//!     println!("{}: {:?}", out.session_id, out.payload);
//! }
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
mod orchestrator;
pub mod registry;
pub mod session;
pub mod source;
pub mod streaming;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, LogstreamToml, ManagerConfig,
};
pub use error::{HandlerError, ManagerError, RegistryError};
pub use manager::Manager;
pub use messages::{
    Line, LineOrigin, OutputPayload, SessionId, StreamCommand, StreamEvent, StreamEventKind,
    StreamInput, StreamOutput,
};
pub use registry::{
    Handler, HandlerRegistry, HandlerRegistryBuilder, LogStream, ResolveOptions,
    ResolvedSources, ResourceKey, Route, SourceBuilder, SourceResolver, StreamOpener,
    StreamRequest,
};
pub use session::{EnabledSources, Session, SessionOptions, SessionStatus, ENABLED_SOURCES_PARAM};
pub use source::{Source, SourceEvent};
pub use streaming::{extract_timestamp, Backoff, ReconnectPolicy};
