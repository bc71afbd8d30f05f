//! Checkpoint persistence (C2): a small resume record saved to
//! `stream_state.json`.
//!
//! Saves are best-effort and atomic (write-to-temp, then rename); a failure
//! is surfaced as [`LoopcastError::CheckpointIo`] and the caller logs it
//! without aborting the broadcast.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::LoopcastResult;

const STALE_CUTOFF_SECS: u64 = 7 * 24 * 60 * 60;

/// The persisted resume record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointRecord {
    #[serde(rename = "currentFile")]
    pub current_file: String,
    /// Relative duration from the file's first video timestamp, serialized
    /// as nanoseconds for lossless round-tripping.
    #[serde(rename = "position", with = "duration_as_nanos")]
    pub position: Duration,
    #[serde(rename = "fileIndex")]
    pub file_index: usize,
    /// Unix-epoch seconds at time of save.
    #[serde(rename = "lastSaveTime")]
    pub last_save_time: u64,
}

mod duration_as_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_nanos())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u128::deserialize(d)?;
        Ok(Duration::from_nanos(nanos as u64))
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Outcome of a checkpoint load.
pub enum LoadOutcome {
    Found(CheckpointRecord),
    NotPresent,
    Stale,
}

/// Reads and writes the checkpoint file at a fixed path.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Serializes `record` deterministically and atomically replaces the
    /// checkpoint file. Sets `last_save_time` to now before writing. Safe
    /// to call many times per minute.
    pub fn save(&self, mut record: CheckpointRecord) -> LoopcastResult<()> {
        record.last_save_time = now_unix_secs();
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| crate::error::LoopcastError::CheckpointIo(e.to_string()))?;

        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Loads the checkpoint record. Returns [`LoadOutcome::NotPresent`] if
    /// the file is missing or malformed, [`LoadOutcome::Stale`] if
    /// `last_save_time` is more than seven days old.
    pub fn load(&self) -> LoadOutcome {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return LoadOutcome::NotPresent,
        };

        let record: CheckpointRecord = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(_) => return LoadOutcome::NotPresent,
        };

        let age = now_unix_secs().saturating_sub(record.last_save_time);
        if age > STALE_CUTOFF_SECS {
            return LoadOutcome::Stale;
        }

        LoadOutcome::Found(record)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "stream_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Default checkpoint path relative to the working directory.
#[must_use]
pub fn default_path() -> PathBuf {
    Path::new("stream_state.json").to_path_buf()
}
