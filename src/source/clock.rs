use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::AudioClock;

/// Audio clock that starts running when video first asks for it.
#[derive(Debug, Default)]
pub struct WallClock {
    start: Mutex<Option<(Instant, i64)>>,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the start point, as after a stream change.
    pub fn reset(&self) {
        *self.start.lock() = None;
    }
}

impl AudioClock for WallClock {
    fn clock(&self) -> Option<i64> {
        self.start
            .lock()
            .map(|(at, base)| base + at.elapsed().as_millis() as i64)
    }

    fn video_ready(&self, video_ms: i64) -> bool {
        let mut start = self.start.lock();
        if start.is_none() {
            debug!("audio clock starts at {} ms", video_ms);
            *start = Some((Instant::now(), video_ms));
        }
        true
    }
}
