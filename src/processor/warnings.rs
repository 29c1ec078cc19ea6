use std::collections::HashMap;

use crate::config::ProcessorConfig;

/// Non-fatal problems found while processing parsed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseWarning {
    /// An audio frame before the append window was discarded instead of
    /// being attached as preroll to the next frame.
    DroppedPreroll,
    /// A frame whose decode timestamp is later than its presentation timestamp.
    DtsBeyondPts,
    /// An audio frame not marked as a keyframe.
    AudioNonKeyframe,
    /// A non-keyframe presented earlier than the keyframe it depends on.
    KeyframeTimeGreaterThanDependant,
    /// Sequence mode used with more than one track.
    MuxedSequenceMode,
}

impl ParseWarning {
    pub fn name(self) -> &'static str {
        match self {
            ParseWarning::DroppedPreroll => "dropped_preroll",
            ParseWarning::DtsBeyondPts => "dts_beyond_pts",
            ParseWarning::AudioNonKeyframe => "audio_non_keyframe",
            ParseWarning::KeyframeTimeGreaterThanDependant => {
                "keyframe_time_greater_than_dependant"
            }
            ParseWarning::MuxedSequenceMode => "muxed_sequence_mode",
        }
    }
}

pub type ParseWarningCallback = Box<dyn FnMut(ParseWarning) + Send>;

/// Caps how many times each warning is surfaced.
pub(crate) struct WarningLimiter {
    config: ProcessorConfig,
    counts: HashMap<ParseWarning, u32>,
    callback: Option<ParseWarningCallback>,
}

impl WarningLimiter {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            counts: HashMap::new(),
            callback: None,
        }
    }

    pub fn set_callback(&mut self, callback: ParseWarningCallback) {
        self.callback = Some(callback);
    }

    pub fn limit(&self, warning: ParseWarning) -> u32 {
        match warning {
            ParseWarning::DroppedPreroll => self.config.max_dropped_preroll_warnings,
            ParseWarning::DtsBeyondPts => self.config.max_dts_beyond_pts_warnings,
            ParseWarning::AudioNonKeyframe => self.config.max_audio_non_keyframe_warnings,
            ParseWarning::KeyframeTimeGreaterThanDependant => {
                self.config.max_keyframe_time_greater_than_dependant_warnings
            }
            ParseWarning::MuxedSequenceMode => self.config.max_muxed_sequence_mode_warnings,
        }
    }

    /// Counts one occurrence against the processor-wide budget. Returns true
    /// if the caller should log it.
    pub fn report(&mut self, warning: ParseWarning) -> bool {
        let mut count = self.counts.get(&warning).copied().unwrap_or(0);
        let reported = self.report_counted(warning, &mut count);
        self.counts.insert(warning, count);
        reported
    }

    /// Like `report`, against a budget owned by the caller (per track).
    pub fn report_counted(&mut self, warning: ParseWarning, count: &mut u32) -> bool {
        let limit = self.limit(warning);
        if *count >= limit {
            return false;
        }
        *count += 1;
        if let Some(callback) = self.callback.as_mut() {
            callback(warning);
        }
        if *count == limit {
            tracing::debug!(
                warning = warning.name(),
                limit,
                "warning limit reached, suppressing further reports"
            );
        }
        true
    }

    pub fn count(&self, warning: ParseWarning) -> u32 {
        self.counts.get(&warning).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_report_stops_at_limit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut limiter = WarningLimiter::new(ProcessorConfig::default());
        limiter.set_callback(Box::new(move |w| sink.lock().unwrap().push(w)));

        let reported = (0..15)
            .filter(|_| limiter.report(ParseWarning::DtsBeyondPts))
            .count();
        assert_eq!(reported, 10);
        assert_eq!(limiter.count(ParseWarning::DtsBeyondPts), 10);

        assert!(limiter.report(ParseWarning::MuxedSequenceMode));
        assert!(!limiter.report(ParseWarning::MuxedSequenceMode));
        assert_eq!(seen.lock().unwrap().len(), 11);
    }

    #[test]
    fn test_counted_budget_is_separate() {
        let mut limiter = WarningLimiter::new(ProcessorConfig::default());
        let mut first = 0;
        let mut second = 0;
        let w = ParseWarning::KeyframeTimeGreaterThanDependant;
        assert!(limiter.report_counted(w, &mut first));
        assert!(!limiter.report_counted(w, &mut first));
        assert!(limiter.report_counted(w, &mut second));
        assert_eq!(limiter.count(w), 0);
    }
}
