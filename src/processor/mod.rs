mod merge;
mod track_buffer;
mod warnings;

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use thiserror::Error;

use crate::buffer::{Frame, FrameTimes, MediaType, SharedSink, StreamError, Timestamp, TrackId};
use crate::config::ProcessorConfig;
use merge::merge_by_decode_order;
use track_buffer::TrackBuffer;
use warnings::WarningLimiter;

pub use merge::FrameQueues;
pub use warnings::{ParseWarning, ParseWarningCallback};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("parsed frames for track {0} are not in decode order")]
    NotInDecodeOrder(TrackId),
    #[error("unknown presentation timestamp for {0} frame")]
    MissingPresentationTimestamp(MediaType),
    #[error("unknown decode timestamp for {0} frame")]
    MissingDecodeTimestamp(MediaType),
    #[error("unknown duration for {media_type} frame at {pts:?}")]
    MissingDuration { media_type: MediaType, pts: Timestamp },
    #[error("negative duration {duration:?} for frame at {pts:?}")]
    NegativeDuration { pts: Timestamp, duration: Timestamp },
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),
    #[error("{frame} frame does not match {expected} track {track}")]
    TrackTypeMismatch {
        track: TrackId,
        frame: MediaType,
        expected: MediaType,
    },
    #[error("frame at {pts:?} has negative decode timestamp {dts:?} after applying the timestamp offset")]
    NegativeDecodeTimestamp { pts: Timestamp, dts: Timestamp },
    #[error("frame at {0:?} hit a second discontinuity while being reprocessed")]
    RepeatedDiscontinuity(Timestamp),
    #[error("track {0} already exists")]
    DuplicateTrack(TrackId),
    #[error("cannot change track id {from} to {to}")]
    TrackIdUpdate { from: TrackId, to: TrackId },
    #[error("track id {0} conflicts with a renamed track")]
    TrackIdConflict(TrackId),
    #[error("sink for track {0} has been dropped")]
    SinkGone(TrackId),
    #[error("stream append failed: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AudioConfig {
    pub codec: String,
    pub samples_per_second: u32,
    pub channels: u32,
}

pub type UpdateDurationCallback = Box<dyn FnMut(Timestamp) + Send>;

/// Runs the coded frame processing algorithm over parsed frames and routes
/// accepted frames to per-track sinks.
pub struct FrameProcessor {
    track_buffers: BTreeMap<TrackId, TrackBuffer>,
    sequence_mode: bool,
    group_start_timestamp: Option<Timestamp>,
    group_end_timestamp: Option<Timestamp>,
    /// Set when the next accepted frame must open a coded frame group on
    /// every track.
    pending_notify_all_group_start: bool,
    audio_preroll: Option<Frame>,
    current_audio_config: Option<AudioConfig>,
    sample_duration: Timestamp,
    warnings: WarningLimiter,
    update_duration: UpdateDurationCallback,
}

impl FrameProcessor {
    pub fn new(
        config: &ProcessorConfig,
        update_duration: impl FnMut(Timestamp) + Send + 'static,
    ) -> Self {
        Self {
            track_buffers: BTreeMap::new(),
            sequence_mode: false,
            group_start_timestamp: None,
            group_end_timestamp: None,
            pending_notify_all_group_start: true,
            audio_preroll: None,
            current_audio_config: None,
            sample_duration: Timestamp::ZERO,
            warnings: WarningLimiter::new(config.clone()),
            update_duration: Box::new(update_duration),
        }
    }

    pub fn set_parse_warning_callback(
        &mut self,
        callback: impl FnMut(ParseWarning) + Send + 'static,
    ) {
        self.warnings.set_callback(Box::new(callback));
    }

    pub fn sequence_mode(&self) -> bool {
        self.sequence_mode
    }

    pub fn set_sequence_mode(&mut self, sequence_mode: bool) {
        tracing::debug!(sequence_mode, "append mode changed");
        if sequence_mode {
            self.group_start_timestamp = self.group_end_timestamp;
        } else if self.sequence_mode {
            self.pending_notify_all_group_start = true;
        }
        self.sequence_mode = sequence_mode;
    }

    pub fn group_end_timestamp(&self) -> Option<Timestamp> {
        self.group_end_timestamp
    }

    /// How many times `warning` has been reported so far.
    pub fn warning_count(&self, warning: ParseWarning) -> u32 {
        self.warnings.count(warning)
    }

    pub fn track_count(&self) -> usize {
        self.track_buffers.len()
    }

    pub fn highest_presentation_timestamp(&self, track_id: TrackId) -> Option<Timestamp> {
        self.track_buffers
            .get(&track_id)?
            .highest_presentation_timestamp()
    }

    /// Registers a track. The processor keeps a weak reference to `sink`.
    pub fn add_track(&mut self, track_id: TrackId, sink: &SharedSink) -> Result<(), ProcessError> {
        if self.track_buffers.contains_key(&track_id) {
            tracing::error!(track = track_id, "failed to add track with duplicate id");
            return Err(ProcessError::DuplicateTrack(track_id));
        }
        let track = TrackBuffer::new(track_id, sink)?;
        tracing::debug!(track = track_id, media_type = %track.media_type(), "track added");
        self.track_buffers.insert(track_id, track);
        Ok(())
    }

    pub fn remove_track(&mut self, track_id: TrackId) -> bool {
        self.track_buffers.remove(&track_id).is_some()
    }

    /// Renames tracks. Either every change applies or none does.
    pub fn update_track_ids(
        &mut self,
        changes: &BTreeMap<TrackId, TrackId>,
    ) -> Result<(), ProcessError> {
        let mut targets = HashSet::new();
        for (&from, &to) in changes {
            if !self.track_buffers.contains_key(&from) || !targets.insert(to) {
                tracing::error!(from, to, "failed to update track id");
                return Err(ProcessError::TrackIdUpdate { from, to });
            }
        }
        if let Some(&id) = self
            .track_buffers
            .keys()
            .find(|id| !changes.contains_key(id) && targets.contains(id))
        {
            tracing::error!(track = id, "track id conflict");
            return Err(ProcessError::TrackIdConflict(id));
        }

        let mut remaining = std::mem::take(&mut self.track_buffers);
        for (from, to) in changes {
            if let Some(mut track) = remaining.remove(from) {
                track.set_track_id(*to);
                self.track_buffers.insert(*to, track);
            }
        }
        self.track_buffers.extend(remaining);
        Ok(())
    }

    pub fn set_group_start_timestamp_if_in_sequence_mode(&mut self, timestamp_offset: Timestamp) {
        tracing::debug!(offset = %timestamp_offset, "group start from timestamp offset");
        if self.sequence_mode {
            self.group_start_timestamp = Some(timestamp_offset);
        }
        self.audio_preroll = None;
    }

    /// Forgets per-group state on every track, as after an abort or a
    /// discontinuity.
    pub fn reset(&mut self) {
        tracing::debug!("resetting track buffers");
        for track in self.track_buffers.values_mut() {
            track.reset();
        }
        if !self.sequence_mode {
            self.pending_notify_all_group_start = true;
            return;
        }
        self.group_start_timestamp = self.group_end_timestamp;
    }

    pub fn on_possible_audio_config_update(&mut self, config: &AudioConfig) {
        self.audio_preroll = None;

        if self.current_audio_config.as_ref() == Some(config) {
            return;
        }
        if config.samples_per_second == 0 {
            tracing::warn!(codec = %config.codec, "ignoring audio config with zero sample rate");
            return;
        }
        self.sample_duration = Timestamp::from_secs_f64(1.0 / f64::from(config.samples_per_second));
        self.current_audio_config = Some(config.clone());
        tracing::debug!(
            codec = %config.codec,
            samples_per_second = config.samples_per_second,
            sample_duration = %self.sample_duration,
            "audio config updated"
        );
    }

    /// Processes one batch of parsed frames against the append window
    /// `[window_start, window_end)`.
    ///
    /// In sequence mode `timestamp_offset` is rewritten so the batch
    /// continues from the current group start. On failure, frames accepted
    /// before the failing one are still delivered to their sinks.
    pub fn process_frames(
        &mut self,
        queues: FrameQueues,
        window_start: Timestamp,
        window_end: Timestamp,
        timestamp_offset: &mut Timestamp,
    ) -> Result<(), ProcessError> {
        let frames = merge_by_decode_order(queues).inspect_err(|e| {
            tracing::error!(error = %e, "parsed frames not in decode order");
        })?;

        if self.sequence_mode
            && self.track_buffers.len() > 1
            && self.warnings.report(ParseWarning::MuxedSequenceMode)
        {
            tracing::warn!(
                tracks = self.track_buffers.len(),
                "sequence append mode with multiple tracks may lose track synchronization"
            );
        }

        for frame in frames {
            if let Err(e) = self.process_frame(frame, window_start, window_end, timestamp_offset) {
                tracing::error!(error = %e, "frame processing failed");
                if let Err(flush_error) = self.flush_processed_frames() {
                    tracing::warn!(error = %flush_error, "flush after failed batch also failed");
                }
                return Err(e);
            }
        }

        self.flush_processed_frames()?;

        (self.update_duration)(self.group_end_timestamp.unwrap_or_default());
        Ok(())
    }

    fn process_frame(
        &mut self,
        mut frame: Frame,
        window_start: Timestamp,
        window_end: Timestamp,
        timestamp_offset: &mut Timestamp,
    ) -> Result<(), ProcessError> {
        let media_type = frame.media_type;
        let track_id = frame.track_id;
        let mut discontinuity_seen = false;

        loop {
            if media_type == MediaType::Audio && !frame.is_keyframe {
                if self.warnings.report(ParseWarning::AudioNonKeyframe) {
                    tracing::warn!(
                        track = track_id,
                        pts = ?frame.pts,
                        dts = ?frame.dts,
                        "audio frame not marked as a keyframe, treating it as one"
                    );
                }
                frame.is_keyframe = true;
            }

            let mut pts = frame
                .pts
                .ok_or(ProcessError::MissingPresentationTimestamp(media_type))?;
            let mut dts = frame
                .dts
                .ok_or(ProcessError::MissingDecodeTimestamp(media_type))?;
            if dts > pts && self.warnings.report(ParseWarning::DtsBeyondPts) {
                tracing::warn!(track = track_id, pts = %pts, dts = %dts, "frame decode timestamp is after its presentation timestamp");
            }
            let duration = frame
                .duration
                .ok_or(ProcessError::MissingDuration { media_type, pts })?;
            if duration.is_negative() {
                return Err(ProcessError::NegativeDuration { pts, duration });
            }

            if self.sequence_mode {
                if let Some(group_start) = self.group_start_timestamp.take() {
                    *timestamp_offset = group_start - pts;
                    tracing::debug!(offset = %timestamp_offset, "timestamp offset updated");
                    self.group_end_timestamp = Some(group_start);
                    self.set_all_track_buffers_need_random_access_point();
                }
            }

            if !timestamp_offset.is_zero() {
                pts += *timestamp_offset;
                dts += *timestamp_offset;
            }

            let track = self
                .track_buffers
                .get(&track_id)
                .ok_or(ProcessError::UnknownTrack(track_id))?;
            if track.media_type() != media_type {
                return Err(ProcessError::TrackTypeMismatch {
                    track: track_id,
                    frame: media_type,
                    expected: track.media_type(),
                });
            }
            let supports_trimming = track.supports_partial_trimming();

            if let Some(last_dts) = track.last_decode_timestamp() {
                let delta = dts - last_dts;
                let last_duration = track.last_frame_duration().unwrap_or_default();
                if delta.is_negative() || delta > last_duration * 2 {
                    if discontinuity_seen {
                        return Err(ProcessError::RepeatedDiscontinuity(dts));
                    }
                    discontinuity_seen = true;
                    if !self.sequence_mode {
                        self.group_end_timestamp = Some(pts);
                    }
                    tracing::debug!(
                        track = track_id,
                        dts = %dts,
                        last_dts = %last_dts,
                        "discontinuity, reprocessing frame"
                    );
                    self.reset();
                    continue;
                }
            }

            frame.pts = Some(pts);
            frame.dts = Some(dts);
            let mut times = FrameTimes { pts, dts, duration };
            if supports_trimming && media_type == MediaType::Audio {
                if let Some(trimmed) = self.handle_partial_append_window_trimming(
                    window_start,
                    window_end,
                    &mut frame,
                    times,
                ) {
                    // The track keeps the untrimmed duration for discontinuity
                    // detection.
                    times = trimmed;
                }
            }
            let frame_end = times.end();

            let track = self
                .track_buffers
                .get_mut(&track_id)
                .ok_or(ProcessError::UnknownTrack(track_id))?;
            if times.pts < window_start || frame_end > window_end {
                track.set_needs_random_access_point(true);
                tracing::trace!(track = track_id, pts = %times.pts, "dropping frame outside append window");
                return Ok(());
            }

            if times.dts.is_negative() {
                return Err(ProcessError::NegativeDecodeTimestamp {
                    pts: times.pts,
                    dts: times.dts,
                });
            }

            if track.needs_random_access_point() {
                if !frame.is_keyframe {
                    tracing::trace!(track = track_id, pts = %times.pts, "dropping frame that is not a random access point");
                    return Ok(());
                }
                track.set_needs_random_access_point(false);
            }

            if self.pending_notify_all_group_start
                || track.last_processed_decode_timestamp() > times.dts
            {
                self.flush_processed_frames()?;
                if self.pending_notify_all_group_start {
                    self.notify_start_of_coded_frame_group(times.dts)?;
                    self.pending_notify_all_group_start = false;
                } else if let Some(track) = self.track_buffers.get_mut(&track_id) {
                    track.notify_start_of_coded_frame_group(times.dts)?;
                }
            }

            let track = self
                .track_buffers
                .get_mut(&track_id)
                .ok_or(ProcessError::UnknownTrack(track_id))?;
            tracing::trace!(track = track_id, pts = %times.pts, dts = %times.dts, "frame accepted");
            if track.enqueue_processed_frame(frame)
                && self.warnings.report_counted(
                    ParseWarning::KeyframeTimeGreaterThanDependant,
                    track.keyframe_time_warnings_mut(),
                )
            {
                tracing::warn!(
                    track = track_id,
                    pts = %times.pts,
                    "non-keyframe is presented before the keyframe it depends on; buffered ranges may be imprecise"
                );
            }

            track.set_last_decode_timestamp(times.dts);
            track.set_last_frame_duration(duration);
            track.set_highest_presentation_timestamp_if_increased(frame_end);

            if self.group_end_timestamp.map_or(true, |end| frame_end > end) {
                self.group_end_timestamp = Some(frame_end);
            }
            return Ok(());
        }
    }

    /// Clips an audio frame to the append window and attaches a preceding
    /// preroll frame when one directly precedes it. Returns the frame's new
    /// timestamps if anything changed.
    fn handle_partial_append_window_trimming(
        &mut self,
        window_start: Timestamp,
        window_end: Timestamp,
        frame: &mut Frame,
        times: FrameTimes,
    ) -> Option<FrameTimes> {
        let frame_end = times.end();

        if times.pts < window_start && frame_end <= window_start {
            self.audio_preroll = Some(frame.clone());
            return None;
        }
        if times.pts >= window_end {
            return None;
        }

        let mut trimmed = times;
        let mut processed = false;

        if let Some(preroll) = self.audio_preroll.take() {
            let preroll_end = preroll.times().map(|t| t.end()).unwrap_or(Timestamp::MAX);
            let delta = preroll_end - times.pts;
            if delta.abs() < self.sample_duration {
                tracing::debug!(
                    preroll_pts = ?preroll.pts,
                    preroll_end = %preroll_end,
                    pts = %times.pts,
                    "attaching audio preroll"
                );
                frame.preroll = Some(Box::new(preroll));
                processed = true;
            } else if self.warnings.report(ParseWarning::DroppedPreroll) {
                tracing::warn!(
                    preroll_pts = ?preroll.pts,
                    gap = %delta,
                    pts = %times.pts,
                    "dropping audio preroll that ends too far from the next frame"
                );
            }
        }

        if times.pts < window_start {
            let front = window_start - times.pts;
            frame.discard_padding = (front, Timestamp::ZERO);
            trimmed.pts = window_start;
            trimmed.dts = times.dts + front;
            trimmed.duration = frame_end - window_start;
            processed = true;
        }

        if frame_end > window_end {
            frame.discard_padding.1 = frame_end - window_end;
            trimmed.duration = window_end - trimmed.pts;
            processed = true;
        }

        if !processed {
            return None;
        }
        frame.pts = Some(trimmed.pts);
        frame.dts = Some(trimmed.dts);
        frame.duration = Some(trimmed.duration);
        Some(trimmed)
    }

    fn set_all_track_buffers_need_random_access_point(&mut self) {
        for track in self.track_buffers.values_mut() {
            track.set_needs_random_access_point(true);
        }
    }

    fn notify_start_of_coded_frame_group(&mut self, start: Timestamp) -> Result<(), ProcessError> {
        tracing::debug!(start = %start, "starting coded frame group on all tracks");
        for track in self.track_buffers.values_mut() {
            track.notify_start_of_coded_frame_group(start)?;
        }
        Ok(())
    }

    /// Flushes every track, reporting the first failure.
    fn flush_processed_frames(&mut self) -> Result<(), ProcessError> {
        let mut result = Ok(());
        for track in self.track_buffers.values_mut() {
            if !track.has_processed_frames() {
                continue;
            }
            if let Err(e) = track.flush_processed_frames() {
                tracing::error!(track = track.track_id(), error = %e, "failed to append processed frames");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
