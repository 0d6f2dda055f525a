use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::kms::{probe, DrmCard};
use crate::DeviceConfig;

/// Open the configured card, or the first `/dev/dri/cardN` that supports
/// dumb buffers and PRIME.
pub fn open_card(config: &DeviceConfig) -> Result<DrmCard> {
    if let Some(path) = &config.path {
        return open_checked(path);
    }

    info!("Auto-detecting DRM card...");
    for i in 0..config.scan_count {
        let path = PathBuf::from(format!("/dev/dri/card{}", i));
        if !path.exists() {
            continue;
        }
        match open_checked(&path) {
            Ok(card) => return Ok(card),
            Err(e) => debug!("skipping {}: {}", path.display(), e),
        }
    }
    Err(eyre!("No usable DRM card found"))
}

fn open_checked(path: &Path) -> Result<DrmCard> {
    let card = DrmCard::open(path)?;
    probe::check_caps(&card)?;
    info!("Using DRM card {}", path.display());
    Ok(card)
}

const COMPATIBLE_PATH: &str = "/sys/firmware/devicetree/base/compatible";

/// Board quirks read from the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Decoders go through the V4L2 memory-to-memory wrappers.
    pub v4l2m2m: bool,
    /// A deinterlacer for hardware surfaces is available.
    pub hw_deinterlace: bool,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            v4l2m2m: false,
            hw_deinterlace: true,
        }
    }
}

impl Platform {
    /// Parse the NUL-separated `compatible` list.
    pub fn from_compatible(raw: &[u8]) -> Self {
        let bcm2711 = raw
            .split(|&b| b == 0)
            .filter_map(|s| std::str::from_utf8(s).ok())
            .any(|s| s.contains("bcm2711"));
        if bcm2711 {
            Self {
                v4l2m2m: true,
                hw_deinterlace: false,
            }
        } else {
            Self::default()
        }
    }

    pub fn detect() -> Self {
        match std::fs::read(COMPATIBLE_PATH) {
            Ok(raw) => {
                let platform = Self::from_compatible(&raw);
                debug!("platform: {:?}", platform);
                platform
            }
            Err(e) => {
                warn!("cannot read {}: {}, assuming generic platform", COMPATIBLE_PATH, e);
                Self::default()
            }
        }
    }

    /// Decoder to ask the codec library for.
    pub fn decoder_name<'a>(&self, codec: &'a str) -> std::borrow::Cow<'a, str> {
        if self.v4l2m2m && matches!(codec, "h264" | "hevc" | "mpeg2video") {
            format!("{}_v4l2m2m", codec).into()
        } else {
            codec.into()
        }
    }
}

pub static PLATFORM: Lazy<Platform> = Lazy::new(Platform::detect);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pi4_is_detected() {
        let raw = b"raspberrypi,4-model-b\0brcm,bcm2711\0";
        let platform = Platform::from_compatible(raw);
        assert!(platform.v4l2m2m);
        assert!(!platform.hw_deinterlace);
        assert_eq!(platform.decoder_name("h264"), "h264_v4l2m2m");
        assert_eq!(platform.decoder_name("vp9"), "vp9");
    }

    #[test]
    fn other_boards_are_generic() {
        let platform = Platform::from_compatible(b"rockchip,rk3399\0");
        assert_eq!(platform, Platform::default());
        assert_eq!(platform.decoder_name("hevc"), "hevc");
    }
}
