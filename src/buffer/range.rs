use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use serde::Deserialize;
use thiserror::Error;

use super::{Frame, FrameTimes, Timestamp};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range operation requires at least one frame")]
    Empty,
    #[error("range must begin with a keyframe")]
    FirstNotKeyframe,
    #[error("frame is missing a timestamp or duration")]
    MissingTimestamps,
    #[error("frames are not in decode order at {0:?}")]
    NotInDecodeOrder(Timestamp),
    #[error("frames starting at {start:?} do not continue range ending at {end:?}")]
    NotContiguous { start: Timestamp, end: Timestamp },
    #[error("timestamp {0:?} is outside the seekable range")]
    OutOfRange(Timestamp),
    #[error("frame at {0:?} has no positive duration")]
    UnsupportedDuration(Timestamp),
    #[error("group of pictures holds the next frame position")]
    GopHoldsCursor,
    #[error("no frames overlap {start:?}..{end:?}")]
    NoFramesInRange { start: Timestamp, end: Timestamp },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    #[default]
    NoGaps,
    AllowGaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOptions {
    pub gap_policy: GapPolicy,
    /// Used as the approximate frame duration until a distance is observed.
    pub default_buffer_duration: Timestamp,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::NoGaps,
            default_buffer_duration: Timestamp::from_millis(125),
        }
    }
}

/// Frames removed from one end of a range.
#[derive(Debug, Default)]
pub struct Evicted {
    pub frames: Vec<Frame>,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    times: FrameTimes,
    frame: Frame,
}

/// A gapless run of one track's frames in decode order.
///
/// Keyframes are indexed by decode timestamp. Positions stored in the index are
/// absolute: `index_base` is the number of frames ever removed from the front,
/// so front eviction does not need to rewrite the index.
#[derive(Debug, Clone)]
pub struct BufferedRange {
    options: RangeOptions,
    slots: VecDeque<Slot>,
    keyframes: BTreeMap<Timestamp, usize>,
    index_base: usize,
    /// Start of the coded frame group when it precedes the first frame.
    range_start: Option<Timestamp>,
    /// May equal `slots.len()`, one past the last frame.
    next_index: Option<usize>,
    highest_frame: Option<FrameTimes>,
    size_in_bytes: usize,
    max_interbuffer_distance: Option<Timestamp>,
}

fn validate(frames: Vec<Frame>) -> Result<Vec<Slot>, RangeError> {
    let mut slots = Vec::with_capacity(frames.len());
    let mut prev: Option<Timestamp> = None;
    for frame in frames {
        let times = frame.times().ok_or(RangeError::MissingTimestamps)?;
        if prev.is_some_and(|p| times.dts < p) {
            return Err(RangeError::NotInDecodeOrder(times.dts));
        }
        prev = Some(times.dts);
        slots.push(Slot { times, frame });
    }
    Ok(slots)
}

impl BufferedRange {
    pub fn new(
        frames: Vec<Frame>,
        range_start: Option<Timestamp>,
        options: RangeOptions,
    ) -> Result<Self, RangeError> {
        let slots = validate(frames)?;
        let first = slots.first().ok_or(RangeError::Empty)?;
        if !first.frame.is_keyframe {
            return Err(RangeError::FirstNotKeyframe);
        }
        let range_start = range_start.filter(|start| *start < first.times.dts);

        let mut range = Self {
            options,
            slots: VecDeque::with_capacity(slots.len()),
            keyframes: BTreeMap::new(),
            index_base: 0,
            range_start,
            next_index: None,
            highest_frame: None,
            size_in_bytes: 0,
            max_interbuffer_distance: None,
        };
        range.push_slots(slots);
        Ok(range)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn gap_policy(&self) -> GapPolicy {
        self.options.gap_policy
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.slots.iter().map(|s| &s.frame)
    }

    /// Appends frames that continue this range in decode order.
    ///
    /// With `group_start`, contiguity is judged from the group start rather
    /// than the first frame, preserving the gap between them.
    pub fn append_frames_to_end(
        &mut self,
        frames: Vec<Frame>,
        group_start: Option<Timestamp>,
    ) -> Result<(), RangeError> {
        let slots = validate(frames)?;
        let first_dts = slots.first().ok_or(RangeError::Empty)?.times.dts;
        if !self.can_append_at(first_dts, group_start) {
            return Err(RangeError::NotContiguous {
                start: group_start.unwrap_or(first_dts),
                end: self.end_timestamp().unwrap_or_default(),
            });
        }
        self.push_slots(slots);
        Ok(())
    }

    pub fn can_append_frames_to_end(
        &self,
        frames: &[Frame],
        group_start: Option<Timestamp>,
    ) -> bool {
        match frames.first().and_then(|f| f.dts) {
            Some(first_dts) => self.can_append_at(first_dts, group_start),
            None => false,
        }
    }

    pub fn append_range_to_end(
        &mut self,
        range: BufferedRange,
        transfer_position: bool,
    ) -> Result<(), RangeError> {
        if !self.can_append_range_to_end(&range) {
            return Err(RangeError::NotContiguous {
                start: range.start_timestamp().unwrap_or_default(),
                end: self.end_timestamp().unwrap_or_default(),
            });
        }
        if transfer_position {
            if let Some(next) = range.next_index {
                self.next_index = Some(next + self.slots.len());
            }
        }
        if let Some(distance) = range.max_interbuffer_distance {
            self.observe_interbuffer_distance(distance);
        }
        self.push_slots(range.slots.into_iter().collect());
        Ok(())
    }

    pub fn can_append_range_to_end(&self, range: &BufferedRange) -> bool {
        match range.slots.front() {
            Some(first) => self.can_append_at(first.times.dts, None),
            None => false,
        }
    }

    fn can_append_at(&self, first_dts: Timestamp, group_start: Option<Timestamp>) -> bool {
        let Some(end) = self.end_timestamp() else {
            return true;
        };
        match group_start {
            None => self.is_next_in_decode_sequence(first_dts),
            Some(start) => {
                start >= end && first_dts >= start && self.is_next_in_decode_sequence(start)
            }
        }
    }

    fn push_slots(&mut self, slots: Vec<Slot>) {
        if let Some(first) = slots.first() {
            self.adjust_estimated_duration(first.times.pts);
        }

        let mut prev_dts = self.end_timestamp();
        for slot in slots {
            let mut distance = slot.times.duration;
            if let Some(prev) = prev_dts {
                distance = distance.max(slot.times.dts - prev);
            }
            self.observe_interbuffer_distance(distance);
            prev_dts = Some(slot.times.dts);

            self.update_end_time(slot.times);
            self.size_in_bytes += slot.frame.data_size();
            if slot.frame.is_keyframe {
                let position = self.index_base + self.slots.len();
                self.keyframes.entry(slot.times.dts).or_insert(position);
            }
            self.slots.push_back(slot);
        }
    }

    fn observe_interbuffer_distance(&mut self, distance: Timestamp) {
        if distance <= Timestamp::ZERO {
            return;
        }
        self.max_interbuffer_distance = Some(match self.max_interbuffer_distance {
            Some(max) => max.max(distance),
            None => distance,
        });
    }

    // Refines a parser-estimated duration once the following frame is known.
    fn adjust_estimated_duration(&mut self, next_pts: Timestamp) {
        let Some(last) = self.slots.back_mut() else {
            return;
        };
        if !last.frame.is_duration_estimated {
            return;
        }
        let delta = next_pts - last.times.pts;
        if delta > Timestamp::ZERO && delta != last.times.duration {
            tracing::trace!(
                pts = %last.times.pts,
                estimated = %last.times.duration,
                refined = %delta,
                "refining estimated frame duration"
            );
            last.times.duration = delta;
            last.frame.duration = Some(delta);
        }
    }

    pub fn approximate_duration(&self) -> Timestamp {
        self.max_interbuffer_distance
            .unwrap_or(self.options.default_buffer_duration)
    }

    /// Any frame starting within this distance of the range end continues it.
    pub fn fudge_room(&self) -> Timestamp {
        self.approximate_duration() * 2
    }

    pub fn is_next_in_decode_sequence(&self, dts: Timestamp) -> bool {
        let Some(end) = self.end_timestamp() else {
            return false;
        };
        if end < dts
            && (self.options.gap_policy == GapPolicy::AllowGaps || dts <= end + self.fudge_room())
        {
            return true;
        }
        dts == end
    }

    pub fn seek(&mut self, timestamp: Timestamp) -> Result<(), RangeError> {
        if !self.can_seek_to(timestamp) {
            return Err(RangeError::OutOfRange(timestamp));
        }
        let (_, position) = self
            .keyframe_at_or_before(timestamp)
            .ok_or(RangeError::OutOfRange(timestamp))?;
        self.next_index = Some(position - self.index_base);
        Ok(())
    }

    pub fn seek_to_start(&mut self) {
        self.next_index = Some(0);
    }

    /// Moves the cursor to the first keyframe at or after `timestamp`.
    pub fn seek_ahead_to(&mut self, timestamp: Timestamp) {
        self.seek_ahead(timestamp, false);
    }

    /// Moves the cursor to the first keyframe strictly after `timestamp`.
    pub fn seek_ahead_past(&mut self, timestamp: Timestamp) {
        self.seek_ahead(timestamp, true);
    }

    fn seek_ahead(&mut self, timestamp: Timestamp, skip_given_timestamp: bool) {
        self.next_index = self
            .keyframe_at(timestamp, skip_given_timestamp)
            .map(|(_, position)| position - self.index_base);
    }

    pub fn has_next_position(&self) -> bool {
        self.next_index.is_some()
    }

    pub fn has_next_frame(&self) -> bool {
        self.next_index.is_some_and(|next| next < self.slots.len())
    }

    pub fn reset_next_position(&mut self) {
        self.next_index = None;
    }

    /// Returns the frame at the cursor and advances past it.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let next = self.next_index.filter(|next| *next < self.slots.len())?;
        self.next_index = Some(next + 1);
        Some(self.slots[next].frame.clone())
    }

    pub fn next_timestamp(&self) -> Option<Timestamp> {
        let next = self.next_index?;
        self.slots.get(next).map(|s| s.times.dts)
    }

    pub fn next_config_id(&self) -> Option<u32> {
        let next = self.next_index?;
        self.slots.get(next).map(|s| s.frame.config_id)
    }

    pub fn config_id_at_time(&self, timestamp: Timestamp) -> Result<u32, RangeError> {
        if !self.can_seek_to(timestamp) {
            return Err(RangeError::OutOfRange(timestamp));
        }
        let (_, position) = self
            .keyframe_at_or_before(timestamp)
            .ok_or(RangeError::OutOfRange(timestamp))?;
        Ok(self.slots[position - self.index_base].frame.config_id)
    }

    pub fn same_config_through_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<bool, RangeError> {
        for timestamp in [start, end] {
            if !self.can_seek_to(timestamp) {
                return Err(RangeError::OutOfRange(timestamp));
            }
        }
        if start >= end {
            return Ok(true);
        }
        let (_, position) = self
            .keyframe_at_or_before(start)
            .ok_or(RangeError::OutOfRange(start))?;
        let index = position - self.index_base;
        let start_config = self.slots[index].frame.config_id;
        Ok(self
            .slots
            .iter()
            .skip(index + 1)
            .take_while(|s| s.times.dts <= end)
            .all(|s| s.frame.config_id == start_config))
    }

    /// Splits off the frames from the first keyframe at or after `timestamp`.
    ///
    /// Returns `None` when no such keyframe exists. The cursor moves to the new
    /// range if it pointed into the split-off frames. This range may be left
    /// empty when the split lands on its first keyframe.
    pub fn split_range(&mut self, timestamp: Timestamp) -> Option<BufferedRange> {
        let (keyframe_dts, position) = self.keyframe_at(timestamp, false)?;
        let keyframe_index = position - self.index_base;

        let has_front_gap = self.range_start.is_some();
        let split_start = (has_front_gap && timestamp < keyframe_dts).then_some(timestamp);

        let removed: Vec<Slot> = self.slots.split_off(keyframe_index).into_iter().collect();
        self.keyframes.split_off(&keyframe_dts);
        self.size_in_bytes -= removed.iter().map(|s| s.frame.data_size()).sum::<usize>();
        self.update_end_time_using_last_gop();

        let mut split = BufferedRange {
            options: self.options,
            slots: VecDeque::with_capacity(removed.len()),
            keyframes: BTreeMap::new(),
            index_base: 0,
            range_start: split_start,
            next_index: None,
            highest_frame: None,
            size_in_bytes: 0,
            max_interbuffer_distance: self.max_interbuffer_distance,
        };
        split.push_slots(removed);

        if let Some(next) = self.next_index {
            if next >= self.slots.len() {
                split.next_index = Some(next - keyframe_index);
                self.next_index = None;
            }
        }

        tracing::trace!(
            at = %keyframe_dts,
            kept = self.slots.len(),
            split = split.len(),
            "split buffered range"
        );
        Some(split)
    }

    /// Removes every frame at (or, if `exclusive`, after) `timestamp`.
    ///
    /// If the removed frames included the cursor, the frames from the cursor
    /// onward are returned and the cursor is reset.
    pub fn truncate_at(&mut self, timestamp: Timestamp, exclusive: bool) -> Vec<Frame> {
        let start = if exclusive {
            self.slots.partition_point(|s| s.times.dts <= timestamp)
        } else {
            self.slots.partition_point(|s| s.times.dts < timestamp)
        };
        self.truncate_from(start)
    }

    fn truncate_from(&mut self, start: usize) -> Vec<Frame> {
        if start >= self.slots.len() {
            return Vec::new();
        }
        let start_dts = self.slots[start].times.dts;

        let mut saved_from = None;
        if let Some(next) = self.next_index {
            if self.next_timestamp().map_or(true, |next_dts| next_dts >= start_dts) {
                if next < self.slots.len() {
                    saved_from = Some(next.saturating_sub(start));
                }
                self.next_index = None;
            }
        }

        self.keyframes.split_off(&start_dts);
        let removed: Vec<Slot> = self.slots.drain(start..).collect();
        self.size_in_bytes -= removed.iter().map(|s| s.frame.data_size()).sum::<usize>();
        self.update_end_time_using_last_gop();

        match saved_from {
            Some(offset) => removed.into_iter().skip(offset).map(|s| s.frame).collect(),
            None => Vec::new(),
        }
    }

    /// Evicts the first group of pictures.
    pub fn delete_gop_from_front(&mut self) -> Result<Evicted, RangeError> {
        if self.slots.is_empty() {
            return Err(RangeError::Empty);
        }
        if self.first_gop_contains_next_position() {
            return Err(RangeError::GopHoldsCursor);
        }

        self.keyframes.pop_first();
        let end_index = self
            .keyframes
            .first_key_value()
            .map(|(_, position)| position - self.index_base)
            .unwrap_or(self.slots.len());

        let mut evicted = Evicted::default();
        for slot in self.slots.drain(..end_index) {
            evicted.bytes += slot.frame.data_size();
            evicted.frames.push(slot.frame);
        }
        self.size_in_bytes -= evicted.bytes;

        let deleted = evicted.frames.len();
        self.index_base += deleted;
        if let Some(next) = self.next_index {
            self.next_index = Some(next.saturating_sub(deleted));
        }
        if deleted > 0 {
            self.range_start = None;
            if self.slots.is_empty() {
                self.highest_frame = None;
            }
        }

        tracing::trace!(
            frames = deleted,
            bytes = evicted.bytes,
            remaining = self.slots.len(),
            "evicted GOP from front"
        );
        Ok(evicted)
    }

    /// Evicts the last group of pictures.
    pub fn delete_gop_from_back(&mut self) -> Result<Evicted, RangeError> {
        if self.slots.is_empty() {
            return Err(RangeError::Empty);
        }
        if self.last_gop_contains_next_position() {
            return Err(RangeError::GopHoldsCursor);
        }

        let goal = self
            .keyframes
            .pop_last()
            .map(|(_, position)| position - self.index_base)
            .unwrap_or(0);

        let mut evicted = Evicted::default();
        for slot in self.slots.drain(goal..) {
            evicted.bytes += slot.frame.data_size();
            evicted.frames.push(slot.frame);
        }
        self.size_in_bytes -= evicted.bytes;
        self.update_end_time_using_last_gop();

        tracing::trace!(
            frames = evicted.frames.len(),
            bytes = evicted.bytes,
            remaining = self.slots.len(),
            "evicted GOP from back"
        );
        Ok(evicted)
    }

    /// Sums whole GOPs starting at the first keyframe at or after `start` and
    /// ending no later than the GOP holding `end`, until `bytes_to_free` is met.
    ///
    /// Returns the reclaimable byte count and the timestamp where removal
    /// would stop, or `None` if nothing can be removed.
    pub fn removal_gop(
        &self,
        start: Timestamp,
        end: Timestamp,
        bytes_to_free: usize,
    ) -> Option<(usize, Timestamp)> {
        let keys: Vec<(Timestamp, usize)> =
            self.keyframes.iter().map(|(k, p)| (*k, *p)).collect();
        let first_gop = keys.partition_point(|(dts, _)| *dts < start);
        if first_gop == keys.len() {
            return None;
        }
        let buffered_end = self.buffered_end_timestamp()?;

        let mut gop_end = keys.len();
        if end < buffered_end {
            gop_end = keys.partition_point(|(dts, _)| *dts <= end).saturating_sub(1);
        }
        // [keyframe]...[start]...[end]...[keyframe]
        if first_gop > 0 && first_gop - 1 == gop_end {
            gop_end = first_gop;
        }

        let mut bytes_removed = 0;
        let mut gop = first_gop;
        let mut buffer_index = keys[first_gop].1 - self.index_base;
        while gop < gop_end && bytes_removed < bytes_to_free {
            gop += 1;
            let next_gop_index = keys
                .get(gop)
                .map(|(_, position)| position - self.index_base)
                .unwrap_or(self.slots.len());
            bytes_removed += self
                .slots
                .range(buffer_index..next_gop_index)
                .map(|s| s.frame.data_size())
                .sum::<usize>();
            buffer_index = next_gop_index;
        }

        if bytes_removed == 0 {
            return None;
        }
        let removal_end = keys.get(gop).map(|(dts, _)| *dts).unwrap_or(buffered_end);
        Some((bytes_removed, removal_end))
    }

    pub fn first_gop_earlier_than_media_time(&self, media_time: Timestamp) -> bool {
        match self.keyframes.len() {
            0 => false,
            1 => self.buffered_end_timestamp().is_some_and(|end| end <= media_time),
            _ => self
                .keyframes
                .keys()
                .nth(1)
                .is_some_and(|second| *second <= media_time),
        }
    }

    pub fn first_gop_contains_next_position(&self) -> bool {
        let Some(next) = self.next_index else {
            return false;
        };
        match self.keyframes.values().nth(1) {
            Some(second) => next < second - self.index_base,
            None => true,
        }
    }

    pub fn last_gop_contains_next_position(&self) -> bool {
        let Some(next) = self.next_index else {
            return false;
        };
        if self.keyframes.len() <= 1 {
            return true;
        }
        self.keyframes
            .values()
            .next_back()
            .is_some_and(|last| last - self.index_base <= next)
    }

    /// Start of the range, including any leading coded frame group gap.
    pub fn start_timestamp(&self) -> Option<Timestamp> {
        let first = self.slots.front()?;
        Some(self.range_start.unwrap_or(first.times.dts))
    }

    /// Decode timestamp of the last frame.
    pub fn end_timestamp(&self) -> Option<Timestamp> {
        self.slots.back().map(|s| s.times.dts)
    }

    pub fn buffered_end_timestamp(&self) -> Option<Timestamp> {
        let last = self.slots.back()?;
        let mut duration = last.times.duration;
        if duration.is_zero() {
            duration = self.approximate_duration();
        }
        Some(last.times.dts + duration)
    }

    /// Highest presentation end time among the frames tracked for the range end.
    pub fn end_presentation_timestamp(&self) -> Option<Timestamp> {
        self.highest_frame.map(|times| times.end())
    }

    pub fn belongs_to_range(&self, timestamp: Timestamp) -> bool {
        if self.is_next_in_decode_sequence(timestamp) {
            return true;
        }
        match (self.start_timestamp(), self.end_timestamp()) {
            (Some(start), Some(end)) => start <= timestamp && timestamp <= end,
            _ => false,
        }
    }

    pub fn next_keyframe_timestamp(&self, timestamp: Timestamp) -> Option<Timestamp> {
        if !self.within_buffered(timestamp) {
            return None;
        }
        let (keyframe_dts, _) = self.keyframe_at(timestamp, false)?;

        // Inside the gap before the first frame, act as if a keyframe is here.
        let is_first = self.keyframes.keys().next() == Some(&keyframe_dts);
        if is_first
            && self.range_start.is_some_and(|start| timestamp > start)
            && timestamp < keyframe_dts
        {
            return Some(timestamp);
        }
        Some(keyframe_dts)
    }

    pub fn keyframe_before_timestamp(&self, timestamp: Timestamp) -> Option<Timestamp> {
        if !self.within_buffered(timestamp) {
            return None;
        }
        self.keyframe_at_or_before(timestamp).map(|(dts, _)| dts)
    }

    pub fn can_seek_to(&self, timestamp: Timestamp) -> bool {
        if self.keyframes.is_empty() {
            return false;
        }
        let (Some(start), Some(end)) = (self.start_timestamp(), self.buffered_end_timestamp())
        else {
            return false;
        };
        let seekable_start = (start - self.fudge_room()).max(Timestamp::ZERO);
        seekable_start <= timestamp && timestamp < end
    }

    /// Returns the frames whose presentation interval overlaps `[start, end)`.
    ///
    /// Fails if any frame scanned lacks a positive duration, or if nothing
    /// overlaps the interval.
    pub fn frames_in_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Frame>, RangeError> {
        let first = self
            .keyframe_before_timestamp(start)
            .ok_or(RangeError::OutOfRange(start))?;
        let from = self.slots.partition_point(|s| s.times.dts < first);

        let mut frames = Vec::new();
        for slot in self.slots.range(from..) {
            if slot.times.duration <= Timestamp::ZERO {
                return Err(RangeError::UnsupportedDuration(slot.times.dts));
            }
            if slot.frame.end_of_stream || slot.times.pts >= end {
                break;
            }
            if slot.times.end() <= start {
                continue;
            }
            frames.push(slot.frame.clone());
        }
        if frames.is_empty() {
            return Err(RangeError::NoFramesInRange { start, end });
        }
        Ok(frames)
    }

    fn within_buffered(&self, timestamp: Timestamp) -> bool {
        if self.keyframes.is_empty() {
            return false;
        }
        match (self.start_timestamp(), self.buffered_end_timestamp()) {
            (Some(start), Some(end)) => start <= timestamp && timestamp < end,
            _ => false,
        }
    }

    // lower_bound when `skip_given_timestamp` is false, upper_bound otherwise.
    fn keyframe_at(
        &self,
        timestamp: Timestamp,
        skip_given_timestamp: bool,
    ) -> Option<(Timestamp, usize)> {
        let lower = if skip_given_timestamp {
            Bound::Excluded(timestamp)
        } else {
            Bound::Included(timestamp)
        };
        self.keyframes
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(dts, position)| (*dts, *position))
    }

    // Falls back to the first keyframe when none is at or before `timestamp`.
    fn keyframe_at_or_before(&self, timestamp: Timestamp) -> Option<(Timestamp, usize)> {
        self.keyframes
            .range(..=timestamp)
            .next_back()
            .or_else(|| self.keyframes.iter().next())
            .map(|(dts, position)| (*dts, *position))
    }

    fn update_end_time(&mut self, times: FrameTimes) {
        let replace = match self.highest_frame {
            None => true,
            Some(highest) => {
                times.pts > highest.pts
                    || (times.pts == highest.pts && times.duration > highest.duration)
            }
        };
        if replace {
            self.highest_frame = Some(times);
        }
    }

    fn update_end_time_using_last_gop(&mut self) {
        self.highest_frame = None;
        let Some(last_gop) = self.keyframes.values().next_back().copied() else {
            return;
        };
        let from = last_gop - self.index_base;
        let tail: Vec<FrameTimes> = self.slots.range(from..).map(|s| s.times).collect();
        for times in tail {
            self.update_end_time(times);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MediaType;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn frame(dts: i64, key: bool) -> Frame {
        Frame::new(1, MediaType::Video, vec![0u8; 100])
            .with_timestamps(ms(dts), ms(dts), ms(10))
            .with_keyframe(key)
    }

    /// Keyframe every `gop` frames, 10ms apart.
    fn frames(start: i64, count: usize, gop: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| frame(start + i as i64 * 10, i % gop == 0))
            .collect()
    }

    fn range(start: i64, count: usize, gop: usize) -> BufferedRange {
        BufferedRange::new(frames(start, count, gop), None, RangeOptions::default()).unwrap()
    }

    fn dts_list(range: &BufferedRange) -> Vec<i64> {
        range.frames().map(|f| f.dts.unwrap().as_millis()).collect()
    }

    #[test]
    fn test_new_requires_keyframe_start() {
        let err = BufferedRange::new(vec![frame(0, false)], None, RangeOptions::default());
        assert_eq!(err.unwrap_err(), RangeError::FirstNotKeyframe);
        let err = BufferedRange::new(Vec::new(), None, RangeOptions::default());
        assert_eq!(err.unwrap_err(), RangeError::Empty);
    }

    #[test]
    fn test_extents() {
        let r = range(0, 6, 3);
        assert_eq!(r.start_timestamp(), Some(ms(0)));
        assert_eq!(r.end_timestamp(), Some(ms(50)));
        assert_eq!(r.buffered_end_timestamp(), Some(ms(60)));
        assert_eq!(r.end_presentation_timestamp(), Some(ms(60)));
        assert_eq!(r.size_in_bytes(), 600);
        assert_eq!(r.approximate_duration(), ms(10));
        assert_eq!(r.fudge_room(), ms(20));
    }

    #[test]
    fn test_append_contiguity() {
        let mut r = range(0, 3, 3);
        assert!(r.is_next_in_decode_sequence(ms(40)));
        assert!(!r.is_next_in_decode_sequence(ms(41)));

        let err = r.append_frames_to_end(vec![frame(100, true)], None);
        assert!(matches!(err, Err(RangeError::NotContiguous { .. })));

        r.append_frames_to_end(frames(30, 3, 3), None).unwrap();
        assert_eq!(dts_list(&r), vec![0, 10, 20, 30, 40, 50]);
        assert_eq!(r.keyframe_before_timestamp(ms(45)), Some(ms(30)));
    }

    #[test]
    fn test_append_with_group_start_preserves_gap() {
        let mut r = range(0, 3, 3);
        // Group starts right after the range, first frame lands later.
        r.append_frames_to_end(vec![frame(70, true)], Some(ms(30)))
            .unwrap();
        assert_eq!(r.end_timestamp(), Some(ms(70)));

        let err = r.append_frames_to_end(vec![frame(200, true)], Some(ms(190)));
        assert!(err.is_err());
    }

    #[test]
    fn test_allow_gaps_policy() {
        let options = RangeOptions {
            gap_policy: GapPolicy::AllowGaps,
            ..RangeOptions::default()
        };
        let mut r = BufferedRange::new(frames(0, 3, 3), None, options).unwrap();
        r.append_frames_to_end(vec![frame(500, true)], None).unwrap();
        assert_eq!(r.len(), 4);
    }

    #[test]
    fn test_seek_uses_keyframe_at_or_before() {
        let mut r = range(0, 9, 3);
        r.seek(ms(45)).unwrap();
        assert_eq!(r.next_timestamp(), Some(ms(30)));
        assert_eq!(r.next_frame().unwrap().dts, Some(ms(30)));
        assert_eq!(r.next_timestamp(), Some(ms(40)));

        r.seek(ms(60)).unwrap();
        assert_eq!(r.next_timestamp(), Some(ms(60)));

        assert_eq!(r.seek(ms(90)), Err(RangeError::OutOfRange(ms(90))));
        // Within fudge room before the start.
        let mut later = range(100, 3, 3);
        later.seek(ms(85)).unwrap();
        assert_eq!(later.next_timestamp(), Some(ms(100)));
    }

    #[test]
    fn test_seek_ahead() {
        let mut r = range(0, 9, 3);
        r.seek_ahead_to(ms(30));
        assert_eq!(r.next_timestamp(), Some(ms(30)));
        r.seek_ahead_past(ms(30));
        assert_eq!(r.next_timestamp(), Some(ms(60)));
        r.seek_ahead_past(ms(60));
        assert!(!r.has_next_position());
    }

    #[test]
    fn test_split_then_append_restores_range() {
        let mut r = range(0, 9, 3);
        let original = dts_list(&r);
        let original_frames: Vec<Frame> = r.frames().cloned().collect();

        let tail = r.split_range(ms(35)).unwrap();
        assert_eq!(dts_list(&r), vec![0, 10, 20, 30, 40, 50]);
        assert_eq!(dts_list(&tail), vec![60, 70, 80]);
        assert_eq!(r.end_presentation_timestamp(), Some(ms(60)));

        r.append_range_to_end(tail, false).unwrap();
        assert_eq!(dts_list(&r), original);
        assert!(r.frames().cloned().eq(original_frames));
        assert_eq!(r.keyframe_before_timestamp(ms(75)), Some(ms(60)));
    }

    #[test]
    fn test_split_without_later_keyframe() {
        let mut r = range(0, 9, 3);
        assert!(r.split_range(ms(65)).is_none());
        assert_eq!(r.len(), 9);
    }

    #[test]
    fn test_split_moves_cursor() {
        let mut r = range(0, 9, 3);
        r.seek(ms(70)).unwrap();
        let mut tail = r.split_range(ms(30)).unwrap();
        assert!(!r.has_next_position());
        assert_eq!(tail.next_timestamp(), Some(ms(60)));
        assert_eq!(tail.next_frame().unwrap().dts, Some(ms(60)));
    }

    #[test]
    fn test_split_inside_front_gap() {
        let mut r =
            BufferedRange::new(frames(100, 3, 3), Some(ms(50)), RangeOptions::default()).unwrap();
        assert_eq!(r.start_timestamp(), Some(ms(50)));
        let tail = r.split_range(ms(70)).unwrap();
        assert!(r.is_empty());
        assert_eq!(tail.start_timestamp(), Some(ms(70)));
    }

    #[test]
    fn test_truncate_returns_frames_from_cursor() {
        let mut r = range(0, 9, 3);
        r.seek(ms(60)).unwrap();
        r.next_frame();

        let removed = r.truncate_at(ms(45), false);
        assert_eq!(
            removed.iter().map(|f| f.dts.unwrap().as_millis()).collect::<Vec<_>>(),
            vec![70, 80]
        );
        assert!(!r.has_next_position());
        assert_eq!(dts_list(&r), vec![0, 10, 20, 30, 40]);
        assert_eq!(r.size_in_bytes(), 500);
        assert_eq!(r.end_presentation_timestamp(), Some(ms(50)));
    }

    #[test]
    fn test_truncate_exclusive_keeps_given_timestamp() {
        let mut r = range(0, 6, 3);
        let removed = r.truncate_at(ms(30), true);
        assert!(removed.is_empty());
        assert_eq!(dts_list(&r), vec![0, 10, 20, 30]);

        r.truncate_at(ms(0), false);
        assert!(r.is_empty());
        assert_eq!(r.end_presentation_timestamp(), None);
    }

    #[test]
    fn test_delete_gop_from_front_keeps_whole_gops() {
        let mut r = BufferedRange::new(frames(0, 8, 3), Some(ms(0)), RangeOptions::default())
            .unwrap();
        let evicted = r.delete_gop_from_front().unwrap();
        assert_eq!(evicted.frames.len(), 3);
        assert_eq!(evicted.bytes, 300);
        assert!(r.frames().next().unwrap().is_keyframe);
        assert_eq!(r.start_timestamp(), Some(ms(30)));

        // Positions still resolve after the index base moved.
        r.seek(ms(65)).unwrap();
        assert_eq!(r.next_timestamp(), Some(ms(60)));
        assert_eq!(r.delete_gop_from_front().unwrap().frames.len(), 3);
        assert_eq!(dts_list(&r), vec![60, 70]);
        assert_eq!(r.next_timestamp(), Some(ms(60)));
        assert_eq!(r.delete_gop_from_front().unwrap_err(), RangeError::GopHoldsCursor);
    }

    #[test]
    fn test_delete_gop_from_back() {
        let mut r = range(0, 8, 3);
        let evicted = r.delete_gop_from_back().unwrap();
        assert_eq!(
            evicted.frames.iter().map(|f| f.dts.unwrap().as_millis()).collect::<Vec<_>>(),
            vec![60, 70]
        );
        assert_eq!(dts_list(&r), vec![0, 10, 20, 30, 40, 50]);
        assert_eq!(r.end_presentation_timestamp(), Some(ms(60)));

        r.seek(ms(35)).unwrap();
        assert_eq!(r.delete_gop_from_back().unwrap_err(), RangeError::GopHoldsCursor);
        r.reset_next_position();
        r.delete_gop_from_back().unwrap();
        r.delete_gop_from_back().unwrap();
        assert!(r.is_empty());
        assert_eq!(r.delete_gop_from_back().unwrap_err(), RangeError::Empty);
    }

    #[test]
    fn test_removal_gop_accumulates_whole_gops() {
        let r = range(0, 9, 3);
        // One GOP covers 300 bytes; asking for 250 takes exactly one.
        assert_eq!(r.removal_gop(ms(0), ms(90), 250), Some((300, ms(30))));
        assert_eq!(r.removal_gop(ms(0), ms(90), 1_000), Some((900, ms(90))));
        // Starting mid GOP skips to the next keyframe.
        assert_eq!(r.removal_gop(ms(5), ms(90), 1_000), Some((600, ms(90))));
        // End inside the GOP after start stops at that GOP's keyframe.
        assert_eq!(r.removal_gop(ms(0), ms(45), 1_000), Some((300, ms(30))));
        // Removal window within one GOP.
        assert_eq!(r.removal_gop(ms(35), ms(55), 1_000), None);
        assert_eq!(r.removal_gop(ms(70), ms(90), 1_000), None);
    }

    #[test]
    fn test_gop_cursor_queries() {
        let mut r = range(0, 9, 3);
        assert!(!r.first_gop_contains_next_position());
        r.seek(ms(10)).unwrap();
        assert!(r.first_gop_contains_next_position());
        assert!(!r.last_gop_contains_next_position());
        r.seek(ms(75)).unwrap();
        assert!(r.last_gop_contains_next_position());

        assert!(r.first_gop_earlier_than_media_time(ms(30)));
        assert!(!r.first_gop_earlier_than_media_time(ms(29)));
    }

    #[test]
    fn test_next_keyframe_in_front_gap() {
        let r = BufferedRange::new(frames(100, 6, 3), Some(ms(60)), RangeOptions::default())
            .unwrap();
        assert_eq!(r.next_keyframe_timestamp(ms(80)), Some(ms(80)));
        assert_eq!(r.next_keyframe_timestamp(ms(60)), Some(ms(100)));
        assert_eq!(r.next_keyframe_timestamp(ms(110)), Some(ms(130)));
        assert_eq!(r.next_keyframe_timestamp(ms(145)), None);
        assert_eq!(r.next_keyframe_timestamp(ms(20)), None);
        assert!(r.can_seek_to(ms(80)));
    }

    #[test]
    fn test_frames_in_range() {
        let r = range(0, 9, 3);
        let frames = r.frames_in_range(ms(35), ms(55)).unwrap();
        assert_eq!(
            frames.iter().map(|f| f.dts.unwrap().as_millis()).collect::<Vec<_>>(),
            vec![30, 40, 50]
        );
        assert_eq!(
            r.frames_in_range(ms(40), ms(40)).unwrap_err(),
            RangeError::NoFramesInRange {
                start: ms(40),
                end: ms(40)
            }
        );

        let zero = vec![
            Frame::new(1, MediaType::Video, vec![1u8])
                .with_timestamps(ms(0), ms(0), ms(0))
                .with_keyframe(true),
        ];
        let r = BufferedRange::new(zero, None, RangeOptions::default()).unwrap();
        assert_eq!(
            r.frames_in_range(ms(0), ms(10)).unwrap_err(),
            RangeError::UnsupportedDuration(ms(0))
        );
    }

    #[test]
    fn test_config_queries() {
        let mut input = frames(0, 6, 3);
        for f in input.iter_mut().skip(3) {
            f.config_id = 2;
        }
        let r = BufferedRange::new(input, None, RangeOptions::default()).unwrap();
        assert_eq!(r.config_id_at_time(ms(25)), Ok(0));
        assert_eq!(r.config_id_at_time(ms(35)), Ok(2));
        assert_eq!(r.same_config_through_range(ms(0), ms(20)), Ok(true));
        assert_eq!(r.same_config_through_range(ms(0), ms(40)), Ok(false));
    }

    #[test]
    fn test_estimated_duration_refined_on_append() {
        let mut first = frame(0, true);
        first.is_duration_estimated = true;
        let mut r = BufferedRange::new(vec![first], None, RangeOptions::default()).unwrap();
        r.append_frames_to_end(
            vec![Frame::new(1, MediaType::Video, vec![0u8])
                .with_timestamps(ms(15), ms(15), ms(10))
                .with_keyframe(false)],
            None,
        )
        .unwrap();
        assert_eq!(r.frames().next().unwrap().duration, Some(ms(15)));
    }
}
