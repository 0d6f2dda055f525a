pub mod format;
pub mod frame;

pub use format::negotiate_format;
pub use frame::{
    Frame, FrameData, PixelFormat, PlanarFormat, PlanarImage, Plane, PrimeDescriptor, PrimeObject,
    PrimePlane, Rational,
};
