use std::sync::{Arc, RwLock, Weak};

use super::ProcessError;
use crate::buffer::{Frame, MediaType, SharedSink, StreamError, Timestamp, TrackId, TrackSink};

/// Per-track coded frame processing state.
///
/// Frames accepted by the processor are staged here and handed to the sink in
/// batches. The sink is held weakly; its owner controls its lifetime.
pub(crate) struct TrackBuffer {
    track_id: TrackId,
    media_type: MediaType,
    supports_partial_trimming: bool,
    sink: Weak<RwLock<dyn TrackSink>>,
    last_decode_timestamp: Option<Timestamp>,
    last_frame_duration: Option<Timestamp>,
    highest_presentation_timestamp: Option<Timestamp>,
    needs_random_access_point: bool,
    /// Decode time of the last frame staged for the sink. Unlike the fields
    /// above this survives `reset`, so a later frame with a smaller decode
    /// time is recognised as starting a new coded frame group.
    last_processed_decode_timestamp: Timestamp,
    last_keyframe_presentation_timestamp: Option<Timestamp>,
    processed_frames: Vec<Frame>,
    keyframe_time_warnings: u32,
}

impl TrackBuffer {
    pub fn new(track_id: TrackId, sink: &SharedSink) -> Result<Self, ProcessError> {
        let (media_type, supports_partial_trimming) = {
            let guard = sink
                .read()
                .map_err(|_| ProcessError::Stream(StreamError::Poisoned))?;
            (
                guard.media_type(),
                guard.supports_partial_append_window_trimming(),
            )
        };
        Ok(Self {
            track_id,
            media_type,
            supports_partial_trimming,
            sink: Arc::downgrade(sink),
            last_decode_timestamp: None,
            last_frame_duration: None,
            highest_presentation_timestamp: None,
            needs_random_access_point: true,
            last_processed_decode_timestamp: Timestamp::ZERO,
            last_keyframe_presentation_timestamp: None,
            processed_frames: Vec::new(),
            keyframe_time_warnings: 0,
        })
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn set_track_id(&mut self, track_id: TrackId) {
        self.track_id = track_id;
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn supports_partial_trimming(&self) -> bool {
        self.supports_partial_trimming
    }

    pub fn last_decode_timestamp(&self) -> Option<Timestamp> {
        self.last_decode_timestamp
    }

    pub fn set_last_decode_timestamp(&mut self, timestamp: Timestamp) {
        self.last_decode_timestamp = Some(timestamp);
    }

    pub fn last_frame_duration(&self) -> Option<Timestamp> {
        self.last_frame_duration
    }

    pub fn set_last_frame_duration(&mut self, duration: Timestamp) {
        self.last_frame_duration = Some(duration);
    }

    pub fn highest_presentation_timestamp(&self) -> Option<Timestamp> {
        self.highest_presentation_timestamp
    }

    pub fn needs_random_access_point(&self) -> bool {
        self.needs_random_access_point
    }

    pub fn set_needs_random_access_point(&mut self, needs: bool) {
        self.needs_random_access_point = needs;
    }

    pub fn last_processed_decode_timestamp(&self) -> Timestamp {
        self.last_processed_decode_timestamp
    }

    pub fn keyframe_time_warnings_mut(&mut self) -> &mut u32 {
        &mut self.keyframe_time_warnings
    }

    pub fn has_processed_frames(&self) -> bool {
        !self.processed_frames.is_empty()
    }

    /// Clears the per-group state ahead of a discontinuity.
    pub fn reset(&mut self) {
        self.last_decode_timestamp = None;
        self.last_frame_duration = None;
        self.highest_presentation_timestamp = None;
        self.needs_random_access_point = true;
        self.last_keyframe_presentation_timestamp = None;
    }

    pub fn set_highest_presentation_timestamp_if_increased(&mut self, timestamp: Timestamp) {
        if self
            .highest_presentation_timestamp
            .map_or(true, |highest| timestamp > highest)
        {
            self.highest_presentation_timestamp = Some(timestamp);
        }
    }

    /// Stages a frame for the sink. Returns true if the frame is presented
    /// before the keyframe it depends on.
    pub fn enqueue_processed_frame(&mut self, frame: Frame) -> bool {
        let mut out_of_order = false;
        if let (Some(pts), Some(dts)) = (frame.pts, frame.dts) {
            if frame.is_keyframe {
                self.last_keyframe_presentation_timestamp = Some(pts);
            } else if self
                .last_keyframe_presentation_timestamp
                .is_some_and(|keyframe_pts| pts < keyframe_pts)
            {
                out_of_order = true;
            }
            self.last_processed_decode_timestamp = dts;
        }
        self.processed_frames.push(frame);
        out_of_order
    }

    /// Hands staged frames to the sink. Staged frames are cleared even when
    /// the append fails.
    pub fn flush_processed_frames(&mut self) -> Result<(), ProcessError> {
        if self.processed_frames.is_empty() {
            return Ok(());
        }
        let frames = std::mem::take(&mut self.processed_frames);
        let count = frames.len();
        let sink = self.upgrade_sink()?;
        let mut guard = sink
            .write()
            .map_err(|_| ProcessError::Stream(StreamError::Poisoned))?;
        guard.append(frames)?;
        tracing::trace!(track = self.track_id, frames = count, "flushed processed frames");
        Ok(())
    }

    pub fn notify_start_of_coded_frame_group(
        &mut self,
        start: Timestamp,
    ) -> Result<(), ProcessError> {
        self.last_keyframe_presentation_timestamp = None;
        self.last_processed_decode_timestamp = start;
        let sink = self.upgrade_sink()?;
        let mut guard = sink
            .write()
            .map_err(|_| ProcessError::Stream(StreamError::Poisoned))?;
        guard.on_start_of_coded_frame_group(start);
        Ok(())
    }

    fn upgrade_sink(&self) -> Result<Arc<RwLock<dyn TrackSink>>, ProcessError> {
        self.sink
            .upgrade()
            .ok_or(ProcessError::SinkGone(self.track_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TrackStream;
    use crate::config::StreamConfig;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn video(pts: i64, dts: i64, keyframe: bool) -> Frame {
        Frame::new(1, MediaType::Video, vec![0u8; 8])
            .with_timestamps(ms(pts), ms(dts), ms(10))
            .with_keyframe(keyframe)
    }

    #[test]
    fn test_reset_keeps_last_processed_dts() {
        let sink: SharedSink = TrackStream::shared(1, MediaType::Video, &StreamConfig::default());
        let mut track = TrackBuffer::new(1, &sink).unwrap();
        assert!(track.needs_random_access_point());

        track.set_last_decode_timestamp(ms(40));
        track.set_needs_random_access_point(false);
        track.set_highest_presentation_timestamp_if_increased(ms(50));
        track.set_highest_presentation_timestamp_if_increased(ms(30));
        assert_eq!(track.highest_presentation_timestamp(), Some(ms(50)));
        track.enqueue_processed_frame(video(40, 40, true));

        track.reset();
        assert_eq!(track.last_decode_timestamp(), None);
        assert_eq!(track.highest_presentation_timestamp(), None);
        assert!(track.needs_random_access_point());
        assert_eq!(track.last_processed_decode_timestamp(), ms(40));
    }

    #[test]
    fn test_dependant_before_keyframe_detected() {
        let sink: SharedSink = TrackStream::shared(1, MediaType::Video, &StreamConfig::default());
        let mut track = TrackBuffer::new(1, &sink).unwrap();
        assert!(!track.enqueue_processed_frame(video(20, 0, true)));
        assert!(track.enqueue_processed_frame(video(10, 10, false)));
        assert!(!track.enqueue_processed_frame(video(30, 20, false)));
    }

    #[test]
    fn test_flush_delivers_and_clears() {
        let stream = TrackStream::shared(1, MediaType::Video, &StreamConfig::default());
        let sink: SharedSink = stream.clone();
        let mut track = TrackBuffer::new(1, &sink).unwrap();

        track.notify_start_of_coded_frame_group(ms(0)).unwrap();
        assert_eq!(track.last_processed_decode_timestamp(), ms(0));
        track.enqueue_processed_frame(video(0, 0, true));
        track.enqueue_processed_frame(video(10, 10, false));
        track.flush_processed_frames().unwrap();
        assert!(!track.has_processed_frames());
        assert_eq!(stream.read().unwrap().buffered(), vec![(ms(0), ms(20))]);
    }

    #[test]
    fn test_flush_after_sink_dropped() {
        let sink: SharedSink = TrackStream::shared(5, MediaType::Audio, &StreamConfig::default());
        let mut track = TrackBuffer::new(5, &sink).unwrap();
        assert!(track.supports_partial_trimming());
        drop(sink);

        track.enqueue_processed_frame(video(0, 0, true));
        assert!(matches!(
            track.flush_processed_frames(),
            Err(ProcessError::SinkGone(5))
        ));
        assert!(!track.has_processed_frames());
    }
}
