//! Kernel mode-setting device access.
//!
//! [`KmsDevice`] is the narrow surface of the DRM API the renderer needs.
//! [`DrmCard`] drives a real `/dev/dri/cardN` node through raw ioctls,
//! [`VirtualCard`] emulates one in memory for tests and headless runs.

pub mod atomic;
pub mod card;
pub mod ioctl;
pub mod probe;
pub mod virt;

use std::fmt;
use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

use drm_fourcc::DrmFourcc;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use atomic::{AtomicRequest, CommitFlags, ObjectProps};
pub use card::DrmCard;
pub use probe::DisplayLayout;
pub use virt::VirtualCard;

/// DRM capability ids (`DRM_CAP_*`).
pub mod cap {
    pub const DUMB_BUFFER: u64 = 0x1;
    pub const PRIME: u64 = 0x5;
    pub const PRIME_IMPORT: u64 = 0x1;
    pub const PRIME_EXPORT: u64 = 0x2;
}

/// DRM client capability ids (`DRM_CLIENT_CAP_*`).
pub mod client_cap {
    pub const UNIVERSAL_PLANES: u64 = 2;
    pub const ATOMIC: u64 = 3;
}

/// Errors raised by the mode-setting layer.
#[derive(Error, Debug)]
pub enum KmsError {
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no usable DRM device found")]
    NoDevice,

    #[error("no connected connector")]
    NoConnector,

    #[error("no usable display mode found")]
    NoMode,

    #[error("no {0} plane found")]
    NoPlane(&'static str),

    #[error("object {object} has no property '{name}'")]
    MissingProperty { object: u32, name: String },

    #[error("unknown {kind} object {id}")]
    UnknownObject { kind: &'static str, id: u32 },

    #[error("atomic commit rejected: {0}")]
    CommitRejected(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl KmsError {
    pub(crate) fn ioctl(op: &'static str, source: nix::Error) -> Self {
        KmsError::Ioctl { op, source }
    }
}

/// A DRM four character pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const NV12: Fourcc = Fourcc(DrmFourcc::Nv12 as u32);
    pub const YUV420: Fourcc = Fourcc(DrmFourcc::Yuv420 as u32);
    pub const ARGB8888: Fourcc = Fourcc(DrmFourcc::Argb8888 as u32);

    /// Bits per pixel used when sizing a dumb buffer for this format.
    pub fn dumb_bpp(self) -> u32 {
        if self == Fourcc::ARGB8888 {
            32
        } else {
            12
        }
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        match std::str::from_utf8(&bytes) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:#010x}", self.0),
        }
    }
}

/// DRM mode object types (`DRM_MODE_OBJECT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Crtc,
    Connector,
    Plane,
}

impl ObjectKind {
    pub fn raw(self) -> u32 {
        match self {
            ObjectKind::Crtc => 0xcccc_cccc,
            ObjectKind::Connector => 0xc0c0_c0c0,
            ObjectKind::Plane => 0xeeee_eeee,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Crtc => "crtc",
            ObjectKind::Connector => "connector",
            ObjectKind::Plane => "plane",
        }
    }
}

/// Value of the immutable plane `type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

impl PlaneType {
    pub fn from_raw(value: u64) -> Self {
        match value {
            1 => PlaneType::Primary,
            2 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            PlaneType::Overlay => 0,
            PlaneType::Primary => 1,
            PlaneType::Cursor => 2,
        }
    }
}

pub const MODE_FLAG_INTERLACE: u32 = 1 << 4;
pub const MODE_CONNECTED: u32 = 1;

/// Display timing, laid out like `struct drm_mode_modeinfo`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; 32],
}

impl ModeInfo {
    /// A mode with only the fields the renderer looks at filled in.
    pub fn simple(hdisplay: u16, vdisplay: u16, vrefresh: u32) -> Self {
        let mut mode = ModeInfo {
            clock: 0,
            hdisplay,
            hsync_start: hdisplay,
            hsync_end: hdisplay,
            htotal: hdisplay,
            hskew: 0,
            vdisplay,
            vsync_start: vdisplay,
            vsync_end: vdisplay,
            vtotal: vdisplay,
            vscan: 0,
            vrefresh,
            flags: 0,
            type_: 0,
            name: [0; 32],
        };
        let label = format!("{hdisplay}x{vdisplay}");
        let len = label.len().min(mode.name.len() - 1);
        mode.name[..len].copy_from_slice(&label.as_bytes()[..len]);
        mode
    }

    pub fn is_interlaced(&self) -> bool {
        self.flags & MODE_FLAG_INTERLACE != 0
    }

    /// Raw bytes, as handed to the kernel in a `MODE_ID` blob.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ModeInfo is repr(C), Copy and contains only plain integers.
        unsafe {
            std::slice::from_raw_parts(
                (self as *const ModeInfo).cast::<u8>(),
                std::mem::size_of::<ModeInfo>(),
            )
        }
    }
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}{}",
            self.hdisplay,
            self.vdisplay,
            self.vrefresh,
            if self.is_interlaced() { "i" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct CardResources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: u32,
    pub encoder_id: u32,
    pub connected: bool,
    pub modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderInfo {
    pub id: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub mode: Option<ModeInfo>,
}

#[derive(Debug, Clone)]
pub struct PlaneInfo {
    pub id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<Fourcc>,
}

/// One property of a mode object.
#[derive(Debug, Clone)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub value: u64,
}

/// Result of `DRM_IOCTL_MODE_CREATE_DUMB`.
#[derive(Debug, Clone, Copy)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// Arguments of `DRM_IOCTL_MODE_ADDFB2`.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifiers: Option<[u64; 4]>,
}

/// The mode-setting operations used by the renderer.
pub trait KmsDevice: Send + Sync {
    fn get_cap(&self, cap: u64) -> Result<u64, KmsError>;
    fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), KmsError>;

    fn resources(&self) -> Result<CardResources, KmsError>;
    fn connector(&self, id: u32) -> Result<ConnectorInfo, KmsError>;
    fn encoder(&self, id: u32) -> Result<EncoderInfo, KmsError>;
    fn crtc(&self, id: u32) -> Result<CrtcInfo, KmsError>;
    fn set_crtc(&self, crtc: &CrtcInfo, connectors: &[u32]) -> Result<(), KmsError>;
    fn plane_ids(&self) -> Result<Vec<u32>, KmsError>;
    fn plane(&self, id: u32) -> Result<PlaneInfo, KmsError>;
    fn properties(&self, object: u32, kind: ObjectKind) -> Result<Vec<Property>, KmsError>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, KmsError>;
    fn map_dumb(&self, handle: u32, size: u64) -> Result<MmapMut, KmsError>;
    fn destroy_dumb(&self, handle: u32) -> Result<(), KmsError>;
    fn prime_fd_to_handle(&self, fd: RawFd) -> Result<u32, KmsError>;
    fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd, KmsError>;
    fn gem_close(&self, handle: u32) -> Result<(), KmsError>;

    fn add_framebuffer(&self, fb: &FramebufferDesc) -> Result<u32, KmsError>;
    fn remove_framebuffer(&self, fb_id: u32) -> Result<(), KmsError>;
    fn create_blob(&self, data: &[u8]) -> Result<u32, KmsError>;

    fn atomic_commit(&self, req: &AtomicRequest, flags: CommitFlags) -> Result<(), KmsError>;

    /// Block until a page-flip completion event arrives or `timeout` passes.
    /// Returns `false` on timeout.
    fn wait_for_flip(&self, timeout: Duration) -> Result<bool, KmsError>;

    /// Current value of a named property, `None` if the object lacks it.
    fn property_value(
        &self,
        object: u32,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Option<u64>, KmsError> {
        Ok(self
            .properties(object, kind)?
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_match_drm() {
        assert_eq!(Fourcc::NV12.0, 0x3231_564e);
        assert_eq!(Fourcc::ARGB8888.0, 0x3432_5241);
        assert_eq!(format!("{:?}", Fourcc::NV12), "NV12");
        assert_eq!(format!("{:?}", Fourcc::YUV420), "YU12");
    }

    #[test]
    fn modeinfo_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<ModeInfo>(), 68);
        let mode = ModeInfo::simple(1920, 1080, 50);
        assert_eq!(mode.as_bytes().len(), 68);
        assert_eq!(format!("{mode:?}"), "1920x1080@50");
    }
}
