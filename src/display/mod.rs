//! Scan-out side: buffers, OSD, plane stacking and the atomic committer.

pub mod buffer;
pub mod commit;
pub mod osd;
pub mod planes;

pub use buffer::{BufferManager, ScanoutBuffer};
pub use commit::{Committer, PictureShape, VideoTarget};
pub use osd::OsdSurface;
pub use planes::{PlaneAssignment, ZposState};
