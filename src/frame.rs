//! Per-frame context supplied by the capture host

use crate::conversation::Endpoint;
use std::time::Duration;

/// What the host knows about the frame being dissected
///
/// `first_visit` is the capability that gates every table mutation: it is
/// true exactly once per frame per capture pass. Later visits (re-rendering
/// an already parsed frame) must only read state.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Monotonically increasing frame number, starting at 1
    pub number: u32,
    /// Capture timestamp relative to the start of the capture
    pub timestamp: Duration,
    pub first_visit: bool,
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl FrameInfo {
    pub fn new(number: u32, timestamp: Duration, src: Endpoint, dst: Endpoint) -> Self {
        FrameInfo {
            number,
            timestamp,
            first_visit: true,
            src,
            dst,
        }
    }

    /// Same frame, presented again after the first pass
    pub fn revisit(self) -> Self {
        FrameInfo {
            first_visit: false,
            ..self
        }
    }
}
