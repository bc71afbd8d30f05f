//! Media Source (C3): wraps the MP4 demuxer.
//!
//! Opens a file, lists its streams, and yields packets in container order.
//! A container whose index (moov box) is unreachable is normalized into
//! [`LoopcastError::StructureInvalid`] so the Session Supervisor can route
//! it to the repair collaborator; any other demux failure is
//! [`LoopcastError::DemuxFailed`].

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use mp4::{Mp4Reader, TrackType};

use crate::error::{LoopcastError, LoopcastResult};
use crate::state::{StreamDescriptor, StreamKind};

/// A demuxed packet as delivered by the media source.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    /// Stream-internal timestamp, i.e. duration since stream origin.
    pub timestamp: Duration,
    /// Mutable: the Pacing Engine may force this true.
    pub is_keyframe: bool,
    pub data: bytes::Bytes,
}

/// Signals returned by [`MediaSource::read_packet`].
pub enum ReadOutcome {
    Packet(Packet),
    EndOfStream,
}

/// Object-safe packet source, implemented by [`MediaSource`] and by
/// in-memory fakes in the Pacing Engine's own test module. Lets the
/// pace/publish loop in `pacing.rs` be exercised against scripted packet
/// sequences instead of real MP4 files, the same way the teacher makes its
/// orchestration logic testable against fake playback backends.
pub trait PacketSource: Send {
    fn read_packet(&mut self) -> LoopcastResult<ReadOutcome>;
}

/// An opened MP4 file and its per-track read cursors.
pub struct MediaSource {
    reader: Mp4Reader<BufReader<File>>,
    tracks: Vec<TrackCursor>,
}

struct TrackCursor {
    track_id: u32,
    stream_index: usize,
    next_sample_id: u32,
    sample_count: u32,
    timescale: u32,
}

impl MediaSource {
    /// Opens `path`, returning the source and its stream descriptors in
    /// track order.
    pub fn open(path: &Path) -> LoopcastResult<(Self, Vec<StreamDescriptor>)> {
        let file = File::open(path)
            .map_err(|e| LoopcastError::DemuxFailed(format!("{}: {e}", path.display())))?;
        let size = file
            .metadata()
            .map_err(|e| LoopcastError::DemuxFailed(e.to_string()))?
            .len();
        let mut buf_reader = BufReader::new(file);
        buf_reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| LoopcastError::DemuxFailed(e.to_string()))?;

        let reader = Mp4Reader::read_header(buf_reader, size).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("moov") {
                LoopcastError::StructureInvalid(msg)
            } else {
                LoopcastError::DemuxFailed(msg)
            }
        })?;

        let mut descriptors = Vec::new();
        let mut tracks = Vec::new();

        for (stream_index, (track_id, track)) in reader.tracks().iter().enumerate() {
            let kind = match track.track_type() {
                Ok(TrackType::Video) => StreamKind::Video,
                Ok(TrackType::Audio) => StreamKind::Audio,
                _ => StreamKind::Other,
            };

            descriptors.push(StreamDescriptor {
                index: stream_index,
                kind,
                width: track.width().ok().map(u32::from),
                height: track.height().ok().map(u32::from),
                sample_rate: track.sample_freq_index().ok().map(|_| track.sample_rate as u32),
                channels: track.channel_count().ok(),
            });

            tracks.push(TrackCursor {
                track_id: *track_id,
                stream_index,
                next_sample_id: 1,
                sample_count: track.sample_count(),
                timescale: track.timescale(),
            });
        }

        Ok((Self { reader, tracks }, descriptors))
    }

    /// Reads the next packet in container (track, sample) scan order.
    ///
    /// Tracks are drained round-robin by ascending next-due timestamp so
    /// that packets are returned in roughly presentation order across
    /// streams; any error other than end-of-track is surfaced as
    /// `demux-failed`.
    pub fn read_packet(&mut self) -> LoopcastResult<ReadOutcome> {
        // Each track's next sample is read once (not twice): the candidate
        // with the earliest timestamp is kept whole rather than re-read
        // after the scan, since `read_sample` needs `&mut self.reader` and
        // can't be called through a `&self` peek while `self.tracks` is
        // borrowed.
        let mut candidate: Option<(usize, Duration, mp4::Mp4Sample)> = None;

        for cursor_idx in 0..self.tracks.len() {
            let (track_id, next_sample_id, sample_count, timescale) = {
                let cursor = &self.tracks[cursor_idx];
                (
                    cursor.track_id,
                    cursor.next_sample_id,
                    cursor.sample_count,
                    cursor.timescale,
                )
            };
            if next_sample_id > sample_count {
                continue;
            }

            let sample = self
                .reader
                .read_sample(track_id, next_sample_id)
                .map_err(|e| LoopcastError::DemuxFailed(e.to_string()))?
                .ok_or(LoopcastError::DemuxFailed(
                    "expected sample not found".to_string(),
                ))?;
            let due = Duration::from_secs_f64(sample.start_time as f64 / timescale.max(1) as f64);

            let better = candidate.as_ref().map(|(_, t, _)| due < *t).unwrap_or(true);
            if better {
                candidate = Some((cursor_idx, due, sample));
            }
        }

        let Some((cursor_idx, timestamp, sample)) = candidate else {
            return Ok(ReadOutcome::EndOfStream);
        };

        let stream_index = self.tracks[cursor_idx].stream_index;
        self.tracks[cursor_idx].next_sample_id += 1;

        Ok(ReadOutcome::Packet(Packet {
            stream_index,
            timestamp,
            is_keyframe: sample.is_sync,
            data: sample.bytes,
        }))
    }

    /// Releases resources. A no-op beyond drop since the reader owns the
    /// file handle, kept as an explicit operation to match the contract.
    pub fn close(self) {
        drop(self);
    }
}

impl PacketSource for MediaSource {
    fn read_packet(&mut self) -> LoopcastResult<ReadOutcome> {
        MediaSource::read_packet(self)
    }
}
