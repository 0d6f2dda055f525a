//! Audio/video synchronisation decisions.

use std::time::Duration;

use crate::SyncConfig;

/// What to do with the frame under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Display,
    /// Video is behind audio: discard the frame and take the next one.
    Drop { diff: i64 },
    /// Video is ahead of audio: keep the current picture up a while longer
    /// and evaluate the same frame again.
    Duplicate { diff: i64 },
    /// Clocks are too far apart to mean anything. Show the frame.
    Desync { diff: i64 },
    /// No audio clock yet.
    AwaitAudio,
}

/// Compare a frame's presentation time with the audio clock.
///
/// `diff` is `video - audio - audio_delay`. Trick play shows every frame.
pub fn decide(
    video_ms: i64,
    audio_ms: Option<i64>,
    trick_speed: u32,
    tuning: &SyncConfig,
) -> SyncDecision {
    if trick_speed != 0 {
        return SyncDecision::Display;
    }
    let Some(audio_ms) = audio_ms else {
        return SyncDecision::AwaitAudio;
    };

    let diff = video_ms - audio_ms - tuning.audio_delay_ms;
    if diff.abs() > tuning.desync_guard_ms {
        SyncDecision::Desync { diff }
    } else if diff < tuning.drop_threshold_ms {
        SyncDecision::Drop { diff }
    } else if diff > tuning.duplicate_threshold_ms {
        SyncDecision::Duplicate { diff }
    } else {
        SyncDecision::Display
    }
}

/// Per-frame pause in trick play.
pub fn trick_delay(speed: u32, tuning: &SyncConfig) -> Duration {
    Duration::from_millis(tuning.trick_step_ms.saturating_mul(speed as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        let t = SyncConfig::default();
        assert_eq!(decide(994, Some(1000), 0, &t), SyncDecision::Drop { diff: -6 });
        assert_eq!(decide(995, Some(1000), 0, &t), SyncDecision::Display);
        assert_eq!(decide(1035, Some(1000), 0, &t), SyncDecision::Display);
        assert_eq!(
            decide(1036, Some(1000), 0, &t),
            SyncDecision::Duplicate { diff: 36 }
        );
    }

    #[test]
    fn audio_delay_shifts_the_window() {
        let t = SyncConfig {
            audio_delay_ms: 40,
            ..Default::default()
        };
        assert_eq!(decide(1040, Some(1000), 0, &t), SyncDecision::Display);
        assert_eq!(decide(1030, Some(1000), 0, &t), SyncDecision::Drop { diff: -10 });
    }

    #[test]
    fn far_apart_clocks_display() {
        let t = SyncConfig::default();
        assert_eq!(
            decide(7000, Some(1000), 0, &t),
            SyncDecision::Desync { diff: 6000 }
        );
        assert_eq!(
            decide(1000, Some(7000), 0, &t),
            SyncDecision::Desync { diff: -6000 }
        );
        assert_eq!(decide(6000, Some(1000), 0, &t), SyncDecision::Duplicate { diff: 5000 });
    }

    #[test]
    fn trick_and_missing_audio() {
        let t = SyncConfig::default();
        assert_eq!(decide(0, Some(1000), 2, &t), SyncDecision::Display);
        assert_eq!(decide(0, None, 2, &t), SyncDecision::Display);
        assert_eq!(decide(0, None, 0, &t), SyncDecision::AwaitAudio);
        assert_eq!(trick_delay(3, &t), Duration::from_millis(60));
    }
}
