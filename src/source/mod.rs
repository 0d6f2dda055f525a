//! Stand-ins for the decoder and the audio output, used by the binary.

pub mod clock;
pub mod pattern;

pub use clock::WallClock;
pub use pattern::TestPattern;
