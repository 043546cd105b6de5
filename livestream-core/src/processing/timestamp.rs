use crate::models::media::Frame;

/// Puts audio and video on one zero-based timeline.
///
/// The first frame seen after [`reset`](Self::reset), whichever stream it
/// belongs to, defines the origin. Every later frame from either stream has
/// the origin subtracted from its `pts` and `dts`. The origin is the first
/// arrival, not the minimum: a stream that started earlier can therefore
/// produce negative timestamps, which the muxers wrap or clamp.
#[derive(Debug, Default, Clone)]
pub struct TimestampSynchronizer {
    origin: Option<i64>,
}

impl TimestampSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the origin; the next frame starts a new timeline.
    pub fn reset(&mut self) {
        self.origin = None;
    }

    pub fn origin(&self) -> Option<i64> {
        self.origin
    }

    /// Shift `frame` onto the session timeline, fixing the origin if unset.
    pub fn normalize(&mut self, mut frame: Frame) -> Frame {
        let origin = *self.origin.get_or_insert(frame.pts);
        frame.pts -= origin;
        frame.dts = frame.dts.map(|dts| dts - origin);
        frame
    }
}
