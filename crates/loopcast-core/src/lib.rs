//! loopcast-core - the packet-pacing and session-continuity engine behind
//! a continuous RTMP restreamer.
//!
//! Publishes a directory of MP4 files, one after another, as a single
//! endless live stream to an RTMP ingest endpoint. Packets arrive in real
//! time, timestamps stay monotonic across file boundaries, and transient
//! errors (demux failure, RTMP disconnect, missing container index) do not
//! stop the broadcast.
//!
//! # Architecture
//!
//! Modules, in dependency order (leaves first):
//!
//! - [`bitrate`]: windowed moving-average bitrate meter
//! - [`checkpoint`]: resume-record persistence
//! - [`media_source`]: MP4 demuxing
//! - [`rtmp_sink`]: RTMP publish session and FLV tag muxing
//! - [`pacing`]: the real-time send loop
//! - [`supervisor`]: outer state machine over files and retries
//! - [`watcher`]: directory scanning
//! - [`state`]: configuration and data model
//! - [`error`]: error taxonomy
//! - [`repair`]: external `ffmpeg` remux collaborator
//! - [`runtime`]: task-spawning abstraction for the checkpoint ticker and
//!   minimum-play-time timer

#![warn(clippy::all)]

pub mod bitrate;
pub mod checkpoint;
pub mod error;
pub mod media_source;
pub mod pacing;
pub mod repair;
pub mod rtmp_sink;
pub mod runtime;
pub mod state;
pub mod supervisor;
pub mod watcher;

pub use bitrate::BitrateMeter;
pub use checkpoint::{CheckpointRecord, CheckpointStore, LoadOutcome};
pub use error::{ErrorCode, LoopcastError, LoopcastResult};
pub use pacing::{CheckpointHandle, PacingOutcome, PacingParams};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use state::{Config, FileEntry, FileState, SessionState, StreamDescriptor, StreamKind};
pub use supervisor::{ensure_default_config, SupervisorState};
