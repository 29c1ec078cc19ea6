use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;
use thiserror::Error;

use crate::buffer::{Frame, MediaType, SharedSink, StreamError, Timestamp, TrackId, TrackStream};
use crate::config::Config;
use crate::processor::{AudioConfig, FrameProcessor, FrameQueues, ProcessError};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse script: {0}")]
    Json(#[from] serde_json::Error),
    #[error("step {step}: track {track} was never added")]
    UnknownTrack { step: usize, track: TrackId },
    #[error("step {step}: append failed: {source}")]
    Append {
        step: usize,
        #[source]
        source: ProcessError,
    },
    #[error("processor error: {0}")]
    Process(#[from] ProcessError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

/// One frame of an `append` step. Times are in milliseconds; the decode time
/// defaults to the presentation time.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFrame {
    pub pts_ms: i64,
    #[serde(default)]
    pub dts_ms: Option<i64>,
    pub duration_ms: i64,
    #[serde(default)]
    pub keyframe: bool,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub config_id: u32,
}

impl ScriptFrame {
    fn to_frame(&self, track_id: TrackId, media_type: MediaType) -> Frame {
        let pts = Timestamp::from_millis(self.pts_ms);
        let dts = self.dts_ms.map_or(pts, Timestamp::from_millis);
        Frame::new(track_id, media_type, vec![0u8; self.size])
            .with_timestamps(pts, dts, Timestamp::from_millis(self.duration_ms))
            .with_keyframe(self.keyframe)
            .with_config_id(self.config_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackFrames {
    pub track: TrackId,
    pub frames: Vec<ScriptFrame>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    AddTrack {
        id: TrackId,
        media_type: MediaType,
    },
    SequenceMode {
        enabled: bool,
    },
    TimestampOffset {
        offset_ms: i64,
    },
    AppendWindow {
        start_ms: i64,
        #[serde(default)]
        end_ms: Option<i64>,
    },
    Append {
        tracks: Vec<TrackFrames>,
    },
    Reset,
    AudioConfig {
        codec: String,
        samples_per_second: u32,
        channels: u32,
    },
    Seek {
        track: TrackId,
        time_ms: i64,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::AddTrack { .. } => "add_track",
            Step::SequenceMode { .. } => "sequence_mode",
            Step::TimestampOffset { .. } => "timestamp_offset",
            Step::AppendWindow { .. } => "append_window",
            Step::Append { .. } => "append",
            Step::Reset => "reset",
            Step::AudioConfig { .. } => "audio_config",
            Step::Seek { .. } => "seek",
        }
    }
}

pub fn load_script<P: AsRef<Path>>(path: P) -> Result<Vec<Step>, ReplayError> {
    let content = std::fs::read_to_string(path)?;
    parse_script(&content)
}

pub fn parse_script(content: &str) -> Result<Vec<Step>, ReplayError> {
    Ok(serde_json::from_str(content)?)
}

struct TrackEntry {
    media_type: MediaType,
    stream: Arc<RwLock<TrackStream>>,
}

/// A source buffer: one frame processor feeding a buffered stream per track.
pub struct Session {
    config: Config,
    processor: FrameProcessor,
    tracks: BTreeMap<TrackId, TrackEntry>,
    timestamp_offset: Timestamp,
    window_start: Timestamp,
    window_end: Timestamp,
    media_time: Timestamp,
    duration: Arc<Mutex<Timestamp>>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let duration = Arc::new(Mutex::new(Timestamp::ZERO));
        let reported = Arc::clone(&duration);
        let mut processor = FrameProcessor::new(&config.processor, move |group_end| {
            if let Ok(mut duration) = reported.lock() {
                if group_end > *duration {
                    tracing::debug!(duration = %group_end, "duration increased");
                    *duration = group_end;
                }
            }
        });
        processor.set_parse_warning_callback(|warning| {
            tracing::debug!(warning = warning.name(), "parse warning");
        });

        Self {
            config,
            processor,
            tracks: BTreeMap::new(),
            timestamp_offset: Timestamp::ZERO,
            window_start: Timestamp::ZERO,
            window_end: Timestamp::MAX,
            media_time: Timestamp::ZERO,
            duration,
        }
    }

    pub fn duration(&self) -> Timestamp {
        self.duration.lock().map(|d| *d).unwrap_or_default()
    }

    pub fn timestamp_offset(&self) -> Timestamp {
        self.timestamp_offset
    }

    pub fn buffered(&self, track_id: TrackId) -> Option<Vec<(Timestamp, Timestamp)>> {
        let entry = self.tracks.get(&track_id)?;
        entry.stream.read().ok().map(|s| s.buffered())
    }

    pub fn stream(&self, track_id: TrackId) -> Option<Arc<RwLock<TrackStream>>> {
        self.tracks.get(&track_id).map(|e| Arc::clone(&e.stream))
    }

    /// Runs every step, stopping at the first failure.
    pub fn run(&mut self, steps: Vec<Step>) -> Result<(), ReplayError> {
        for (index, step) in steps.into_iter().enumerate() {
            let name = step.name();
            self.run_step(index, step)?;
            self.log_buffered(index, name);
        }
        Ok(())
    }

    pub fn run_step(&mut self, index: usize, step: Step) -> Result<(), ReplayError> {
        match step {
            Step::AddTrack { id, media_type } => {
                let stream = TrackStream::shared(id, media_type, &self.config.stream);
                let sink: SharedSink = stream.clone();
                self.processor.add_track(id, &sink)?;
                self.tracks.insert(id, TrackEntry { media_type, stream });
            }
            Step::SequenceMode { enabled } => self.processor.set_sequence_mode(enabled),
            Step::TimestampOffset { offset_ms } => {
                self.timestamp_offset = Timestamp::from_millis(offset_ms);
                self.processor
                    .set_group_start_timestamp_if_in_sequence_mode(self.timestamp_offset);
            }
            Step::AppendWindow { start_ms, end_ms } => {
                self.window_start = Timestamp::from_millis(start_ms);
                self.window_end = end_ms.map_or(Timestamp::MAX, Timestamp::from_millis);
            }
            Step::Append { tracks } => self.append(index, tracks)?,
            Step::Reset => self.processor.reset(),
            Step::AudioConfig {
                codec,
                samples_per_second,
                channels,
            } => self.processor.on_possible_audio_config_update(&AudioConfig {
                codec,
                samples_per_second,
                channels,
            }),
            Step::Seek { track, time_ms } => {
                let entry = self
                    .tracks
                    .get(&track)
                    .ok_or(ReplayError::UnknownTrack { step: index, track })?;
                let time = Timestamp::from_millis(time_ms);
                let mut stream = entry.stream.write().map_err(|_| StreamError::Poisoned)?;
                stream.seek(time)?;
                self.media_time = time;
            }
        }
        Ok(())
    }

    fn append(&mut self, index: usize, tracks: Vec<TrackFrames>) -> Result<(), ReplayError> {
        let mut queues = FrameQueues::new();
        for TrackFrames {
            track: track_id,
            frames: script_frames,
        } in tracks
        {
            let entry = self
                .tracks
                .get(&track_id)
                .ok_or(ReplayError::UnknownTrack { step: index, track: track_id })?;

            let frames: Vec<Frame> = script_frames
                .iter()
                .map(|f| f.to_frame(track_id, entry.media_type))
                .collect();
            let incoming: usize = frames.iter().map(Frame::data_size).sum();
            let mut stream = entry.stream.write().map_err(|_| StreamError::Poisoned)?;
            if !stream.garbage_collect(self.media_time, incoming) {
                tracing::warn!(
                    track = track_id,
                    incoming,
                    "buffer is full, appending anyway"
                );
            }
            queues.insert(track_id, frames);
        }

        self.processor
            .process_frames(
                queues,
                self.window_start,
                self.window_end,
                &mut self.timestamp_offset,
            )
            .map_err(|source| ReplayError::Append { step: index, source })
    }

    fn log_buffered(&self, index: usize, step: &str) {
        for (track_id, entry) in &self.tracks {
            let Ok(stream) = entry.stream.read() else {
                continue;
            };
            let ranges: Vec<String> = stream
                .buffered()
                .iter()
                .map(|(start, end)| format!("[{}, {})", start, end))
                .collect();
            tracing::info!(
                step = index,
                kind = step,
                track = track_id,
                bytes = stream.buffered_bytes(),
                "buffered {}",
                ranges.join(" ")
            );
        }
    }
}
