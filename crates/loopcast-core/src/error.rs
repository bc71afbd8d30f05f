//! Centralized error types for the loopcast core library.
//!
//! Defines the error taxonomy the rest of the crate propagates with `?` and
//! groups the recovery policy for each kind next to its definition so that
//! the Session Supervisor can read it off the type instead of re-deriving it.

use std::path::PathBuf;

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code, used
/// only in status-line output (there is no HTTP API to serialize these to).
pub trait ErrorCode {
    /// Returns a short, stable identifier for the error kind.
    fn code(&self) -> &'static str;
}

/// Crate-wide error type covering every failure kind in the error taxonomy.
#[derive(Debug, Error)]
pub enum LoopcastError {
    /// Configuration file present but malformed, or a required setting is
    /// missing. Fatal at startup.
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// Directory watcher found no candidate files.
    #[error("directory is empty: {0}")]
    DirectoryEmpty(PathBuf),

    /// Media source's container index (moov atom) is unreachable.
    #[error("container structure invalid: {0}")]
    StructureInvalid(String),

    /// Any other demux failure, including unexpected EOF mid-read.
    #[error("demux failed: {0}")]
    DemuxFailed(String),

    /// RTMP TCP connect or DNS resolution failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// RTMP handshake or publish negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A packet or header write to the RTMP sink failed. The sink must be
    /// considered unusable after this and re-dialed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Checkpoint persistence failed. Never fatal; logged and ignored by
    /// the caller.
    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(String),

    /// The external repair collaborator (ffmpeg) failed or was not found.
    #[error("repair failed: {0}")]
    RepairFailed(String),
}

impl ErrorCode for LoopcastError {
    fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::DirectoryEmpty(_) => "directory_empty",
            Self::StructureInvalid(_) => "structure_invalid",
            Self::DemuxFailed(_) => "demux_failed",
            Self::ConnectFailed(_) => "connect_failed",
            Self::HandshakeFailed(_) => "handshake_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::CheckpointIo(_) => "checkpoint_io",
            Self::RepairFailed(_) => "repair_failed",
        }
    }
}

impl From<std::io::Error> for LoopcastError {
    fn from(err: std::io::Error) -> Self {
        Self::CheckpointIo(err.to_string())
    }
}

impl From<mp4::Error> for LoopcastError {
    fn from(err: mp4::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("moov") {
            Self::StructureInvalid(msg)
        } else {
            Self::DemuxFailed(msg)
        }
    }
}

/// Convenient Result alias for crate-wide operations.
pub type LoopcastResult<T> = Result<T, LoopcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_invalid_code() {
        let err = LoopcastError::StructureInvalid("moov atom missing".into());
        assert_eq!(err.code(), "structure_invalid");
    }

    #[test]
    fn io_error_maps_to_checkpoint_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LoopcastError = io_err.into();
        assert_eq!(err.code(), "checkpoint_io");
    }
}
