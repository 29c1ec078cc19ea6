use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Timestamp;

pub type TrackId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Text,
}

impl MediaType {
    pub fn name(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Text => "text",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed coded frame as produced by a stream parser.
///
/// Timestamps are optional because parsers may fail to provide them; the frame
/// processor rejects such frames before they reach a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub track_id: TrackId,
    pub media_type: MediaType,
    pub config_id: u32,
    pub is_keyframe: bool,
    pub pts: Option<Timestamp>,
    pub dts: Option<Timestamp>,
    pub duration: Option<Timestamp>,
    pub is_duration_estimated: bool,
    /// Amount to discard from the (front, back) of the decoded output.
    pub discard_padding: (Timestamp, Timestamp),
    pub end_of_stream: bool,
    /// Audio frame preceding the append window, decoded but not rendered.
    pub preroll: Option<Box<Frame>>,
    pub data: Bytes,
}

/// Validated timestamps of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimes {
    pub pts: Timestamp,
    pub dts: Timestamp,
    pub duration: Timestamp,
}

impl FrameTimes {
    pub fn end(&self) -> Timestamp {
        self.pts + self.duration
    }
}

impl Frame {
    pub fn new(track_id: TrackId, media_type: MediaType, data: impl Into<Bytes>) -> Self {
        Self {
            track_id,
            media_type,
            config_id: 0,
            is_keyframe: false,
            pts: None,
            dts: None,
            duration: None,
            is_duration_estimated: false,
            discard_padding: (Timestamp::ZERO, Timestamp::ZERO),
            end_of_stream: false,
            preroll: None,
            data: data.into(),
        }
    }

    pub fn with_timestamps(mut self, pts: Timestamp, dts: Timestamp, duration: Timestamp) -> Self {
        self.pts = Some(pts);
        self.dts = Some(dts);
        self.duration = Some(duration);
        self
    }

    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    pub fn with_config_id(mut self, config_id: u32) -> Self {
        self.config_id = config_id;
        self
    }

    pub fn times(&self) -> Option<FrameTimes> {
        Some(FrameTimes {
            pts: self.pts?,
            dts: self.dts?,
            duration: self.duration?,
        })
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn type_name(&self) -> &'static str {
        self.media_type.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_requires_all_fields() {
        let frame = Frame::new(1, MediaType::Video, vec![0u8; 4]);
        assert!(frame.times().is_none());

        let frame = frame.with_timestamps(
            Timestamp::from_millis(40),
            Timestamp::from_millis(20),
            Timestamp::from_millis(10),
        );
        let times = frame.times().unwrap();
        assert_eq!(times.end(), Timestamp::from_millis(50));
        assert_eq!(frame.data_size(), 4);
    }
}
