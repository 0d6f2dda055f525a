//! Frame flow from the decoder to the display: rings, filtering, AV sync
//! and the render context that ties them together.

pub mod filter;
pub mod render;
pub mod ringbuf;
pub mod sync;

pub use filter::{FilterFactory, FilterGraph, FilterOutput, SoftwareFilters};
pub use render::RenderContext;
pub use ringbuf::FrameRing;
pub use sync::{decide, SyncDecision};
