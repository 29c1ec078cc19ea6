mod frame;
mod range;
mod stream;
mod timestamp;

pub use frame::{Frame, FrameTimes, MediaType, TrackId};
pub use range::{BufferedRange, Evicted, GapPolicy, RangeError, RangeOptions};
pub use stream::{SharedSink, StreamError, TrackSink, TrackStream};
pub use timestamp::Timestamp;
