/// The audio side of the player, as seen by the display thread.
pub trait AudioClock: Send + Sync {
    /// Current audio presentation time in milliseconds, `None` while audio
    /// has not started.
    fn clock(&self) -> Option<i64>;

    /// Whether audio is ready to start together with video at `video_ms`.
    /// Polled before the first frame of a stream is shown.
    fn video_ready(&self, video_ms: i64) -> bool;
}
