use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use super::ProcessError;
use crate::buffer::{Frame, Timestamp, TrackId};

/// Parsed frames keyed by track, each queue in decode order.
pub type FrameQueues = BTreeMap<TrackId, Vec<Frame>>;

/// Merges per-track queues into one sequence ordered by decode timestamp.
///
/// The merge is stable within a track; frames from different tracks with the
/// same decode timestamp are taken in ascending track id order.
pub(crate) fn merge_by_decode_order(queues: FrameQueues) -> Result<Vec<Frame>, ProcessError> {
    let total = queues.values().map(Vec::len).sum();
    let mut pending: BTreeMap<TrackId, VecDeque<(Timestamp, Frame)>> = BTreeMap::new();

    for (track_id, frames) in queues {
        let mut queue = VecDeque::with_capacity(frames.len());
        let mut previous: Option<Timestamp> = None;
        for frame in frames {
            let dts = frame
                .dts
                .ok_or(ProcessError::MissingDecodeTimestamp(frame.media_type))?;
            if previous.is_some_and(|p| dts < p) {
                return Err(ProcessError::NotInDecodeOrder(track_id));
            }
            previous = Some(dts);
            queue.push_back((dts, frame));
        }
        pending.insert(track_id, queue);
    }

    let mut heap: BinaryHeap<Reverse<(Timestamp, TrackId)>> = pending
        .iter()
        .filter_map(|(id, queue)| queue.front().map(|(dts, _)| Reverse((*dts, *id))))
        .collect();

    let mut merged = Vec::with_capacity(total);
    while let Some(Reverse((_, track_id))) = heap.pop() {
        let Some(queue) = pending.get_mut(&track_id) else {
            continue;
        };
        let Some((_, frame)) = queue.pop_front() else {
            continue;
        };
        if let Some((dts, _)) = queue.front() {
            heap.push(Reverse((*dts, track_id)));
        }
        merged.push(frame);
    }

    Ok(merged)
}
