//! Core data model: configuration, session-scope and file-scope state.
//!
//! Provides the typed configuration record ([`Config`]) loaded from
//! `config.json`, and the in-memory records the Session Supervisor and
//! Pacing Engine thread through a run ([`SessionState`], [`FileState`]).

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::bitrate::BitrateMeter;

/// RTMP destination settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RtmpConfig {
    /// Base RTMP URL, e.g. `rtmp://localhost/live/`.
    pub url: String,
    /// Stream key, concatenated directly onto `url` with no separator.
    pub key: String,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            url: "rtmp://localhost/live/".to_string(),
            key: "stream".to_string(),
        }
    }
}

/// Input video source settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VideoConfig {
    /// Directory scanned for `.mp4` files.
    pub directory: PathBuf,
    /// Reserved: the supervisor already loops unconditionally over the
    /// directory contents regardless of this flag.
    pub loop_mode: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("video"),
            loop_mode: true,
        }
    }
}

/// Pacing and supervisor tunables.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Target bitrate hint in bits/s. `0` means "use the default floor".
    pub force_bitrate: u64,
    /// When true, the Pacing Engine periodically forces the keyframe flag.
    pub force_keyframe: bool,
    /// Interval in seconds between forced keyframes.
    pub keyframe_seconds: u64,
    /// Retained for the config surface; the supervisor dials once per file
    /// attempt unconditionally regardless of this value (see DESIGN.md).
    pub reconnect_on_new_file: bool,
    /// Disables early-end detection when true.
    pub disable_early_end: bool,
    /// Minimum seconds a file must broadcast before early-end is considered.
    pub min_play_time: u64,
    /// Whether to resume from `stream_state.json` at startup.
    pub restore_state: bool,
    /// Maximum attempts per file before surfacing the error.
    pub max_retries: u32,
    /// Delay between per-file retry attempts, in seconds.
    pub retry_delay_seconds: u64,
    /// Consecutive failed files before the supervisor backs off.
    pub max_consecutive_errors: u32,
    /// Backoff duration after `max_consecutive_errors`, in seconds.
    pub reconnect_timeout_seconds: u64,
    /// Status-line warning floor, in bits/s.
    pub min_bitrate_warning_bps: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            force_bitrate: 0,
            force_keyframe: false,
            keyframe_seconds: 2,
            reconnect_on_new_file: true,
            disable_early_end: false,
            min_play_time: 60,
            restore_state: true,
            max_retries: 3,
            retry_delay_seconds: 5,
            max_consecutive_errors: 10,
            reconnect_timeout_seconds: 10,
            min_bitrate_warning_bps: 1_500_000,
        }
    }
}

/// Top-level configuration for loopcast, loaded from `config.json`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub rtmp: RtmpConfig,
    pub video: VideoConfig,
    pub settings: Settings,
}

impl Config {
    /// Returns the full publish URL: `rtmp.url` concatenated with `rtmp.key`,
    /// no separator added.
    #[must_use]
    pub fn publish_url(&self) -> String {
        format!("{}{}", self.rtmp.url, self.rtmp.key)
    }
}

/// Kind of a stream descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Per-input-stream descriptor, used only for the RTMP header and for
/// routing packets to the correct timebase.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: StreamKind,
    /// Video only.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Audio only.
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// A pathname, display name and size produced by a directory rescan.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub display_name: String,
    pub size: u64,
}

/// Process-wide session state: file list, cursor, session bitrate meter,
/// and the consecutive-error counter. Created at start, mutated only by
/// the Session Supervisor, destroyed at process exit.
pub struct SessionState {
    pub files: Vec<FileEntry>,
    pub cursor: usize,
    pub bitrate_meter: BitrateMeter,
    pub consecutive_errors: u32,
}

impl SessionState {
    #[must_use]
    pub fn new(files: Vec<FileEntry>, window: usize) -> Self {
        Self {
            files,
            cursor: 0,
            bitrate_meter: BitrateMeter::new(window),
            consecutive_errors: 0,
        }
    }
}

/// One-per-file-attempt state carried by the Pacing Engine.
pub struct FileState {
    /// First-seen video timestamp, set once and never updated.
    pub tv0: Option<std::time::Duration>,
    /// First-seen audio timestamp, set once and never updated.
    pub ta0: Option<std::time::Duration>,
    /// Last-seen video relative position.
    pub last_video_pos: std::time::Duration,
    /// Last-seen audio relative position.
    pub last_audio_pos: std::time::Duration,
    /// Observed max relative position (approximates duration so far).
    pub max_position: std::time::Duration,
    /// Wall-clock base: a packet with relative position `p` is due at
    /// `base + p`.
    pub base: Option<Instant>,
    /// Bitrate meter scoped to this file attempt.
    pub bitrate_meter: BitrateMeter,
    pub end_detected: bool,
    pub minimum_playtime_reached: bool,
}

impl FileState {
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            tv0: None,
            ta0: None,
            last_video_pos: std::time::Duration::ZERO,
            last_audio_pos: std::time::Duration::ZERO,
            max_position: std::time::Duration::ZERO,
            base: None,
            bitrate_meter: BitrateMeter::new(window),
            end_detected: false,
            minimum_playtime_reached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_url_concatenates_without_separator() {
        let config = Config {
            rtmp: RtmpConfig {
                url: "rtmp://example.com/live/".to_string(),
                key: "abc123".to_string(),
            },
            ..Default::default()
        };
        assert_eq!(config.publish_url(), "rtmp://example.com/live/abc123");
    }

    #[test]
    fn config_default_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.video.directory, PathBuf::from("video"));
        assert!(config.video.loop_mode);
        assert_eq!(config.settings.min_play_time, 60);
        assert_eq!(config.settings.max_retries, 3);
        assert_eq!(config.settings.retry_delay_seconds, 5);
        assert_eq!(config.settings.max_consecutive_errors, 10);
        assert_eq!(config.settings.reconnect_timeout_seconds, 10);
        assert!(config.settings.restore_state);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rtmp.url, config.rtmp.url);
        assert_eq!(parsed.settings.min_play_time, config.settings.min_play_time);
    }
}
