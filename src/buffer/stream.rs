use std::sync::{Arc, RwLock};

use thiserror::Error;

use super::{BufferedRange, Frame, MediaType, RangeError, RangeOptions, Timestamp, TrackId};
use crate::config::StreamConfig;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("coded frame group starting at {0:?} does not begin with a keyframe")]
    GroupNotAtKeyframe(Timestamp),
    #[error("range error: {0}")]
    Range(#[from] RangeError),
    #[error("track stream lock poisoned")]
    Poisoned,
}

/// Per-track destination for processed frames.
pub trait TrackSink: Send + Sync {
    fn media_type(&self) -> MediaType;

    /// Whether frames overlapping the append window may be trimmed rather
    /// than dropped.
    fn supports_partial_append_window_trimming(&self) -> bool;

    fn on_start_of_coded_frame_group(&mut self, start: Timestamp);

    fn append(&mut self, frames: Vec<Frame>) -> Result<(), StreamError>;
}

pub type SharedSink = Arc<RwLock<dyn TrackSink>>;

/// A track's buffered media: disjoint ranges ordered by start time.
pub struct TrackStream {
    track_id: TrackId,
    media_type: MediaType,
    options: RangeOptions,
    memory_limit: usize,
    ranges: Vec<BufferedRange>,
    pending_group_start: Option<Timestamp>,
    last_appended_dts: Option<Timestamp>,
}

impl TrackStream {
    pub fn new(track_id: TrackId, media_type: MediaType, config: &StreamConfig) -> Self {
        Self {
            track_id,
            media_type,
            options: config.range_options(),
            memory_limit: config.memory_limit(media_type),
            ranges: Vec::new(),
            pending_group_start: None,
            last_appended_dts: None,
        }
    }

    pub fn shared(
        track_id: TrackId,
        media_type: MediaType,
        config: &StreamConfig,
    ) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::new(track_id, media_type, config)))
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn ranges(&self) -> &[BufferedRange] {
        &self.ranges
    }

    /// Buffered intervals as `(start, end)` decode times.
    pub fn buffered(&self) -> Vec<(Timestamp, Timestamp)> {
        self.ranges
            .iter()
            .filter_map(|r| Some((r.start_timestamp()?, r.buffered_end_timestamp()?)))
            .collect()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ranges.iter().map(|r| r.size_in_bytes()).sum()
    }

    pub fn seek(&mut self, timestamp: Timestamp) -> Result<(), StreamError> {
        for range in &mut self.ranges {
            range.reset_next_position();
        }
        let range = self
            .ranges
            .iter_mut()
            .find(|r| r.can_seek_to(timestamp))
            .ok_or(RangeError::OutOfRange(timestamp))?;
        range.seek(timestamp)?;
        tracing::debug!(track = self.track_id, timestamp = %timestamp, "seeked track stream");
        Ok(())
    }

    /// Reads the frame at the cursor. At the end of a range the cursor moves
    /// on to the following range if that range continues it.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let mut index = self.ranges.iter().position(|r| r.has_next_position())?;
        while !self.ranges[index].has_next_frame() {
            let next_start = self.ranges.get(index + 1)?.start_timestamp()?;
            if !self.ranges[index].is_next_in_decode_sequence(next_start) {
                return None;
            }
            self.ranges[index].reset_next_position();
            index += 1;
            self.ranges[index].seek_to_start();
            tracing::trace!(
                track = self.track_id,
                start = %next_start,
                "read position moved to adjacent range"
            );
        }
        self.ranges[index].next_frame()
    }

    /// Removes buffered frames with decode time in `[start, end)`.
    pub fn remove(&mut self, start: Timestamp, end: Timestamp) {
        self.remove_internal(start, false, end);
    }

    /// Reports how many bytes whole-GOP removal within `[start, end)` could
    /// reclaim, and where that removal would stop.
    pub fn removal_candidate(
        &self,
        start: Timestamp,
        end: Timestamp,
        bytes_to_free: usize,
    ) -> Option<(usize, Timestamp)> {
        let mut total = 0;
        let mut removal_end = None;
        for range in &self.ranges {
            if total >= bytes_to_free {
                break;
            }
            if let Some((bytes, stop)) = range.removal_gop(start, end, bytes_to_free - total) {
                total += bytes;
                removal_end = Some(stop);
            }
        }
        removal_end.map(|stop| (total, stop))
    }

    /// Evicts whole GOPs until `new_data_size` more bytes fit in the memory
    /// limit. Returns false if the budget could not be met.
    pub fn garbage_collect(&mut self, media_time: Timestamp, new_data_size: usize) -> bool {
        let target = self.buffered_bytes() + new_data_size;
        if target <= self.memory_limit {
            return true;
        }
        let mut bytes_to_free = target - self.memory_limit;

        // Data already played goes first.
        let mut index = 0;
        while bytes_to_free > 0 && index < self.ranges.len() {
            let front = &mut self.ranges[index];
            if !front.first_gop_earlier_than_media_time(media_time) {
                break;
            }
            let Ok(evicted) = front.delete_gop_from_front() else {
                break;
            };
            let emptied = front.is_empty();

            // The GOP holding the append position stays, as a range of its own.
            let last_dts = evicted.frames.last().and_then(|f| f.dts);
            if last_dts.is_some() && last_dts == self.last_appended_dts {
                match BufferedRange::new(evicted.frames, None, self.options) {
                    Ok(kept) if emptied => self.ranges[index] = kept,
                    Ok(kept) => self.ranges.insert(index, kept),
                    Err(e) => {
                        tracing::warn!(
                            track = self.track_id,
                            error = %e,
                            "failed to keep appended GOP"
                        );
                        self.last_appended_dts = None;
                        if emptied {
                            self.ranges.remove(index);
                        }
                        continue;
                    }
                }
                index += 1;
                continue;
            }

            bytes_to_free = bytes_to_free.saturating_sub(evicted.bytes);
            if emptied {
                self.ranges.remove(index);
            }
        }

        // Then data beyond the current append position.
        while bytes_to_free > 0 {
            let Some(back) = self.ranges.last_mut() else {
                break;
            };
            if back.end_timestamp() == self.last_appended_dts {
                break;
            }
            let Ok(evicted) = back.delete_gop_from_back() else {
                break;
            };
            bytes_to_free = bytes_to_free.saturating_sub(evicted.bytes);
            if back.is_empty() {
                self.ranges.pop();
            }
        }

        tracing::debug!(
            track = self.track_id,
            buffered_bytes = self.buffered_bytes(),
            limit = self.memory_limit,
            remaining = bytes_to_free,
            "garbage collection finished"
        );
        bytes_to_free == 0
    }

    fn remove_internal(&mut self, start: Timestamp, start_exclusive: bool, end: Timestamp) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for mut range in self.ranges.drain(..) {
            let (Some(range_start), Some(range_end)) =
                (range.start_timestamp(), range.end_timestamp())
            else {
                continue;
            };
            let before = range_end < start || (start_exclusive && range_end == start);
            if before || range_start >= end {
                kept.push(range);
                continue;
            }

            let tail = range.split_range(end);
            let dropped = range.truncate_at(start, start_exclusive);
            if !dropped.is_empty() {
                tracing::debug!(
                    track = self.track_id,
                    frames = dropped.len(),
                    "removal discarded frames after the read position"
                );
            }
            if !range.is_empty() {
                kept.push(range);
            }
            if let Some(tail) = tail {
                kept.push(tail);
            }
        }
        self.ranges = kept;
    }

    fn insert_range(&mut self, range: BufferedRange) -> usize {
        let start = range.start_timestamp();
        let index = self
            .ranges
            .partition_point(|r| r.start_timestamp() < start);
        self.ranges.insert(index, range);
        index
    }

    fn merge_adjacent(&mut self, mut index: usize) {
        if index > 0 && self.ranges[index - 1].can_append_range_to_end(&self.ranges[index]) {
            let range = self.ranges.remove(index);
            index -= 1;
            if let Err(e) = self.ranges[index].append_range_to_end(range, true) {
                tracing::error!(track = self.track_id, error = %e, "failed to merge ranges");
                return;
            }
        }
        while index + 1 < self.ranges.len()
            && self.ranges[index].can_append_range_to_end(&self.ranges[index + 1])
        {
            let next = self.ranges.remove(index + 1);
            if let Err(e) = self.ranges[index].append_range_to_end(next, true) {
                tracing::error!(track = self.track_id, error = %e, "failed to merge ranges");
                return;
            }
            tracing::trace!(track = self.track_id, ranges = self.ranges.len(), "merged ranges");
        }
    }
}

impl TrackSink for TrackStream {
    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn supports_partial_append_window_trimming(&self) -> bool {
        self.media_type == MediaType::Audio
    }

    fn on_start_of_coded_frame_group(&mut self, start: Timestamp) {
        tracing::trace!(track = self.track_id, start = %start, "coded frame group start");
        self.pending_group_start = Some(start);
        self.last_appended_dts = None;
    }

    fn append(&mut self, frames: Vec<Frame>) -> Result<(), StreamError> {
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return Ok(());
        };
        let first_dts = first.dts.ok_or(RangeError::MissingTimestamps)?;
        let last_dts = last.dts.ok_or(RangeError::MissingTimestamps)?;
        let first_is_keyframe = first.is_keyframe;
        let group_start = self.pending_group_start.take();

        // Existing data overlapped by the new frames is replaced.
        let removal_end = last_dts + Timestamp::from_micros(1);
        match self.last_appended_dts {
            Some(last_appended) => self.remove_internal(last_appended, true, removal_end),
            None => {
                let start = group_start.map_or(first_dts, |gs| gs.min(first_dts));
                self.remove_internal(start, false, removal_end);
            }
        }

        let continues = match self.last_appended_dts {
            Some(last_appended) => self
                .ranges
                .iter()
                .position(|r| r.end_timestamp() == Some(last_appended)),
            None => self
                .ranges
                .iter()
                .position(|r| r.can_append_frames_to_end(&frames, group_start)),
        };

        let index = match continues {
            Some(index) if self.ranges[index].can_append_frames_to_end(&frames, group_start) => {
                self.ranges[index].append_frames_to_end(frames, group_start)?;
                index
            }
            _ => {
                let mut frames = frames;
                if !first_is_keyframe {
                    if group_start.is_some() {
                        return Err(StreamError::GroupNotAtKeyframe(first_dts));
                    }
                    // The range this continued is gone; resume at the next keyframe.
                    let Some(keyframe) = frames.iter().position(|f| f.is_keyframe) else {
                        tracing::debug!(
                            track = self.track_id,
                            frames = frames.len(),
                            "dropped continuation frames without a keyframe"
                        );
                        self.last_appended_dts = Some(last_dts);
                        return Ok(());
                    };
                    tracing::debug!(
                        track = self.track_id,
                        frames = keyframe,
                        "dropped continuation frames ahead of keyframe"
                    );
                    frames.drain(..keyframe);
                }
                let range = BufferedRange::new(frames, group_start, self.options)?;
                tracing::debug!(
                    track = self.track_id,
                    start = %range.start_timestamp().unwrap_or_default(),
                    "starting new buffered range"
                );
                self.insert_range(range)
            }
        };

        self.last_appended_dts = Some(last_dts);
        self.merge_adjacent(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn frames(start: i64, count: usize, gop: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| {
                let t = ms(start + i as i64 * 10);
                Frame::new(7, MediaType::Video, vec![0u8; 100])
                    .with_timestamps(t, t, ms(10))
                    .with_keyframe(i % gop == 0)
            })
            .collect()
    }

    fn stream() -> TrackStream {
        TrackStream::new(7, MediaType::Video, &StreamConfig::default())
    }

    #[test]
    fn test_append_continues_group() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 3, 3)).unwrap();
        s.append(frames(30, 3, 3)).unwrap();
        assert_eq!(s.buffered(), vec![(ms(0), ms(60))]);
        assert_eq!(s.buffered_bytes(), 600);
    }

    #[test]
    fn test_new_group_creates_range_and_merges() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(100));
        s.append(frames(100, 3, 3)).unwrap();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 3, 3)).unwrap();
        assert_eq!(s.buffered(), vec![(ms(0), ms(30)), (ms(100), ms(130))]);

        // Filling the gap joins all three.
        s.append(frames(30, 7, 7)).unwrap();
        assert_eq!(s.buffered(), vec![(ms(0), ms(130))]);
        assert_eq!(s.ranges().len(), 1);
    }

    #[test]
    fn test_group_must_start_with_keyframe() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        let mut input = frames(0, 2, 3);
        input[0].is_keyframe = false;
        assert!(matches!(
            s.append(input),
            Err(StreamError::GroupNotAtKeyframe(_))
        ));
    }

    #[test]
    fn test_continuation_after_remove_resumes_at_keyframe() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 3, 3)).unwrap();
        s.remove(ms(0), ms(30));
        assert!(s.buffered().is_empty());

        let mut input = frames(30, 4, 4);
        input[0].is_keyframe = false;
        input[2].is_keyframe = true;
        s.append(input).unwrap();
        assert_eq!(s.buffered(), vec![(ms(50), ms(70))]);

        // Without any keyframe only the append position moves.
        s.remove(ms(0), ms(100));
        let mut input = frames(70, 2, 3);
        input[0].is_keyframe = false;
        s.append(input).unwrap();
        assert!(s.buffered().is_empty());
        s.append(frames(90, 3, 3)).unwrap();
        assert_eq!(s.buffered(), vec![(ms(90), ms(120))]);
    }

    #[test]
    fn test_garbage_collect_keeps_appended_gop() {
        let config = StreamConfig {
            video_memory_limit_bytes: 300,
            ..StreamConfig::default()
        };
        let mut s = TrackStream::new(7, MediaType::Video, &config);
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 3, 3)).unwrap();

        assert!(!s.garbage_collect(ms(100), 200));
        assert_eq!(s.buffered(), vec![(ms(0), ms(30))]);

        let mut input = frames(30, 2, 1);
        input[0].is_keyframe = false;
        s.append(input).unwrap();
        assert_eq!(s.buffered(), vec![(ms(0), ms(50))]);
    }

    #[test]
    fn test_overlapping_append_replaces_frames() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 9, 3)).unwrap();
        s.on_start_of_coded_frame_group(ms(30));
        s.append(frames(30, 3, 3)).unwrap();
        // The GOP at 60 survives the removal and is merged back.
        assert_eq!(s.buffered(), vec![(ms(0), ms(90))]);
        assert_eq!(s.buffered_bytes(), 900);
    }

    #[test]
    fn test_seek_and_read() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 6, 3)).unwrap();
        s.seek(ms(45)).unwrap();
        assert_eq!(s.next_frame().unwrap().dts, Some(ms(30)));
        assert_eq!(s.next_frame().unwrap().dts, Some(ms(40)));
        assert!(s.seek(ms(500)).is_err());
    }

    #[test]
    fn test_read_continues_into_adjacent_range() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 9, 2)).unwrap();
        // Leaves a gap narrower than the fudge room.
        s.remove(ms(30), ms(40));
        assert_eq!(s.buffered(), vec![(ms(0), ms(30)), (ms(40), ms(90))]);

        s.seek(ms(0)).unwrap();
        let read: Vec<i64> = std::iter::from_fn(|| s.next_frame())
            .map(|f| f.dts.unwrap().as_millis())
            .collect();
        assert_eq!(read, vec![0, 10, 20, 40, 50, 60, 70, 80]);
    }

    #[test]
    fn test_read_stops_before_distant_range() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 3, 3)).unwrap();
        s.on_start_of_coded_frame_group(ms(500));
        s.append(frames(500, 3, 3)).unwrap();

        s.seek(ms(0)).unwrap();
        assert_eq!(std::iter::from_fn(|| s.next_frame()).count(), 3);
        assert!(s.next_frame().is_none());
    }

    #[test]
    fn test_remove_splits_range() {
        let mut s = stream();
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 9, 3)).unwrap();
        s.remove(ms(30), ms(60));
        assert_eq!(s.buffered(), vec![(ms(0), ms(30)), (ms(60), ms(90))]);
    }

    #[test]
    fn test_garbage_collect_front_first() {
        let config = StreamConfig {
            video_memory_limit_bytes: 600,
            ..StreamConfig::default()
        };
        let mut s = TrackStream::new(7, MediaType::Video, &config);
        s.on_start_of_coded_frame_group(ms(0));
        s.append(frames(0, 9, 3)).unwrap();
        assert_eq!(s.removal_candidate(ms(0), ms(90), 300), Some((300, ms(30))));

        assert!(s.garbage_collect(ms(60), 0));
        assert_eq!(s.buffered(), vec![(ms(30), ms(90))]);
        assert_eq!(s.buffered_bytes(), 600);
    }
}
