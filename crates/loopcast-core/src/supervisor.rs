//! Session Supervisor (C6): the outer state machine over files and
//! retries. Orchestrates C1–C5, dials repair on structural corruption, and
//! drives checkpoint saves at file boundaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::{CheckpointRecord, CheckpointStore, LoadOutcome};
use crate::error::{LoopcastError, LoopcastResult};
use crate::media_source::MediaSource;
use crate::pacing::{self, CheckpointHandle, PacingParams};
use crate::repair;
use crate::runtime::TaskSpawner;
use crate::state::{Config, SessionState, StreamKind};
use crate::watcher;

/// Supervisor state, logged on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Scanning,
    Playing(usize),
    BetweenFiles,
    Repairing(usize),
    Backoff,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scanning => write!(f, "Scanning"),
            Self::Playing(i) => write!(f, "Playing({i})"),
            Self::BetweenFiles => write!(f, "BetweenFiles"),
            Self::Repairing(i) => write!(f, "Repairing({i})"),
            Self::Backoff => write!(f, "Backoff"),
        }
    }
}

fn transition(state: SupervisorState) -> SupervisorState {
    tracing::info!("supervisor state -> {state}");
    state
}

/// Runs the supervisor loop forever. Returns only on a fatal startup
/// error; streaming errors are absorbed internally per the error taxonomy.
pub async fn run(config: Config, spawner: Arc<dyn TaskSpawner>) -> LoopcastResult<()> {
    let checkpoint_store = Arc::new(CheckpointStore::new(crate::checkpoint::default_path()));
    let checkpoint_handle = CheckpointHandle::new(CheckpointRecord {
        current_file: String::new(),
        position: Duration::ZERO,
        file_index: 0,
        last_save_time: 0,
    });
    pacing::spawn_checkpoint_ticker(
        spawner.as_ref(),
        checkpoint_handle.clone(),
        checkpoint_store.clone(),
        Duration::from_secs(10),
    );

    let mut state = transition(SupervisorState::Scanning);

    let mut session = loop {
        match watcher::scan(&config.video.directory) {
            Ok(files) if !files.is_empty() => break SessionState::new(files, 5),
            Ok(_) => {
                tracing::warn!(
                    "directory {} has no .mp4 files, rescanning in 5s",
                    config.video.directory.display()
                );
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                tracing::warn!("directory scan failed: {e}, rescanning in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };

    let mut resume_position = Duration::ZERO;
    if config.settings.restore_state {
        match checkpoint_store.load() {
            LoadOutcome::Found(record) => {
                if let Some(idx) = session
                    .files
                    .iter()
                    .position(|f| f.display_name == record.current_file)
                {
                    tracing::info!(
                        "resuming {} at {:.1}s",
                        record.current_file,
                        record.position.as_secs_f64()
                    );
                    session.cursor = idx;
                    resume_position = record.position;
                } else {
                    tracing::warn!(
                        "checkpoint names {} which is not in the current file list, starting from the first file",
                        record.current_file
                    );
                }
            }
            LoadOutcome::NotPresent | LoadOutcome::Stale => {}
        }
    }

    loop {
        state = transition(SupervisorState::Playing(session.cursor));

        let file = session.files[session.cursor].clone();
        let start_position = resume_position;
        resume_position = Duration::ZERO;

        let outcome = run_file_attempt(
            &config,
            &checkpoint_store,
            &checkpoint_handle,
            spawner.as_ref(),
            &mut session,
            &file,
            start_position,
        )
        .await;

        match outcome {
            Ok(prepare_next) => {
                session.consecutive_errors = 0;
                state = transition(SupervisorState::BetweenFiles);

                if prepare_next {
                    if let Ok(rescanned) = watcher::scan(&config.video.directory) {
                        if rescanned.len() > session.files.len() {
                            session.files = rescanned;
                        }
                    }
                }

                session.cursor += 1;
                if session.cursor >= session.files.len() {
                    session.cursor = 0;
                    state = transition(SupervisorState::Scanning);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Ok(rescanned) = watcher::scan(&config.video.directory) {
                        if !rescanned.is_empty() {
                            session.files = rescanned;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("file attempt failed: {e}");
                session.consecutive_errors += 1;
                session.cursor = (session.cursor + 1) % session.files.len().max(1);

                if session.consecutive_errors >= config.settings.max_consecutive_errors {
                    state = transition(SupervisorState::Backoff);
                    tokio::time::sleep(Duration::from_secs(
                        config.settings.reconnect_timeout_seconds,
                    ))
                    .await;
                    session.consecutive_errors = 0;
                }
            }
        }
    }
}

/// Runs up to `max_retries` attempts of a single file, returning whether
/// the file ended via `PrepareNext` (early-end) on success.
async fn run_file_attempt(
    config: &Config,
    checkpoint_store: &Arc<CheckpointStore>,
    checkpoint_handle: &CheckpointHandle,
    spawner: &dyn TaskSpawner,
    session: &mut SessionState,
    file: &crate::state::FileEntry,
    start_position: Duration,
) -> LoopcastResult<bool> {
    let mut repair_attempts = 0u32;
    let mut last_error = None;

    for attempt in 0..config.settings.max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(config.settings.retry_delay_seconds)).await;
        }

        match try_once(
            config,
            checkpoint_store,
            checkpoint_handle,
            spawner,
            session,
            file,
            start_position,
            &mut repair_attempts,
        )
        .await
        {
            Ok(prepare_next) => return Ok(prepare_next),
            Err(e) => {
                tracing::warn!("attempt {} for {} failed: {e}", attempt + 1, file.display_name);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| LoopcastError::DemuxFailed("no attempts made".to_string())))
}

async fn try_once(
    config: &Config,
    checkpoint_store: &Arc<CheckpointStore>,
    checkpoint_handle: &CheckpointHandle,
    spawner: &dyn TaskSpawner,
    session: &mut SessionState,
    file: &crate::state::FileEntry,
    start_position: Duration,
    repair_attempts: &mut u32,
) -> LoopcastResult<bool> {
    let (mut media, descriptors) = match MediaSource::open(&file.path) {
        Ok(opened) => opened,
        Err(LoopcastError::StructureInvalid(msg)) if *repair_attempts < 2 => {
            tracing::info!("structure invalid ({msg}), attempting repair");
            *repair_attempts += 1;
            repair::repair(&file.path)
                .await
                .map_err(|e| LoopcastError::RepairFailed(e.to_string()))?;
            MediaSource::open(&file.path)?
        }
        Err(e) => return Err(e),
    };

    let video_stream = descriptors
        .iter()
        .find(|d| d.kind == StreamKind::Video)
        .map(|d| d.index);
    let audio_stream = descriptors
        .iter()
        .find(|d| d.kind == StreamKind::Audio)
        .map(|d| d.index);

    let mut sink = crate::rtmp_sink::RtmpSink::dial(&config.publish_url())
        .await
        .map_err(|e| match e {
            LoopcastError::HandshakeFailed(_) => e,
            other => LoopcastError::ConnectFailed(other.to_string()),
        })?;
    sink.write_header(&descriptors)?;

    let mut file_state = crate::state::FileState::new(5);
    checkpoint_handle.update(file.display_name.clone(), start_position, session.cursor);

    let params = PacingParams {
        video_stream,
        audio_stream,
        min_play_time: Duration::from_secs(config.settings.min_play_time),
        start_position,
        force_keyframe: config.settings.force_keyframe,
        keyframe_interval: Duration::from_secs(config.settings.keyframe_seconds),
        disable_early_end: config.settings.disable_early_end,
        min_bitrate_warning_bps: config.settings.min_bitrate_warning_bps as f64,
        current_file_name: file.display_name.clone(),
        file_index: session.cursor,
    };

    let result = pacing::run(
        &mut media,
        &mut sink,
        &mut file_state,
        &mut session.bitrate_meter,
        checkpoint_handle,
        checkpoint_store,
        spawner,
        &params,
    )
    .await;

    sink.close();

    let outcome = result?;
    Ok(outcome.prepare_next)
}

/// Writes a default `config.json` if none is present at `path`.
pub fn ensure_default_config(path: &PathBuf) -> LoopcastResult<()> {
    if path.exists() {
        return Ok(());
    }
    let default = Config::default();
    let json = serde_json::to_string_pretty(&default)
        .map_err(|e| LoopcastError::ConfigInvalid(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}
