//! Building and submitting the per-frame atomic commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};

use super::buffer::ScanoutBuffer;
use super::osd::OsdSurface;
use super::planes::{PlaneAssignment, ZposState};
use crate::kms::{AtomicRequest, CommitFlags, DisplayLayout, KmsDevice, KmsError, ModeInfo, ObjectProps};
use crate::metric;
use crate::video::Rational;

/// The buffer to put on the video plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTarget {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoTarget {
    pub fn of(buf: &ScanoutBuffer) -> Self {
        Self {
            fb_id: buf.fb_id,
            width: buf.width,
            height: buf.height,
        }
    }
}

/// Picture geometry used for aspect ratio correction.
#[derive(Debug, Clone, Copy)]
pub struct PictureShape {
    pub width: u32,
    pub height: u32,
    pub sample_aspect: Rational,
}

fn set_plane_crtc(req: &mut AtomicRequest, plane: &ObjectProps, x: u64, y: u64, w: u64, h: u64) {
    plane.set(req, "CRTC_X", x);
    plane.set(req, "CRTC_Y", y);
    plane.set(req, "CRTC_W", w);
    plane.set(req, "CRTC_H", h);
}

fn set_plane_src(req: &mut AtomicRequest, plane: &ObjectProps, w: u32, h: u32) {
    plane.set(req, "SRC_X", 0);
    plane.set(req, "SRC_Y", 0);
    plane.set(req, "SRC_W", (w as u64) << 16);
    plane.set(req, "SRC_H", (h as u64) << 16);
}

/// Width of the picture on screen: full mode height, width from the sample
/// aspect ratio, never wider than the mode.
pub fn pic_width(mode: &ModeInfo, shape: Option<PictureShape>) -> u64 {
    let hdisplay = mode.hdisplay as u64;
    let width = match shape {
        Some(s) if s.height != 0 => {
            (mode.vdisplay as f64 * s.sample_aspect.as_f64() * s.width as f64 / s.height as f64)
                as u64
        }
        _ => hdisplay,
    };
    if width == 0 || width > hdisplay {
        hdisplay
    } else {
        width
    }
}

/// Program the mode and put the OSD and black buffers up.
#[instrument(level = "debug", skip_all)]
pub fn modeset(
    card: &dyn KmsDevice,
    layout: &DisplayLayout,
    osd: &ScanoutBuffer,
    black: &ScanoutBuffer,
) -> Result<(), KmsError> {
    let mode = layout.mode;
    let (hd, vd) = (mode.hdisplay as u64, mode.vdisplay as u64);
    let blob = card.create_blob(mode.as_bytes())?;

    let mut req = AtomicRequest::new();
    layout.crtc.set(&mut req, "MODE_ID", blob as u64);
    layout.connector.set(&mut req, "CRTC_ID", layout.crtc.id as u64);
    layout.crtc.set(&mut req, "ACTIVE", 1);

    let video = &layout.video;
    set_plane_crtc(&mut req, video, 0, 0, hd, vd);
    video.set(&mut req, "CRTC_ID", layout.crtc.id as u64);
    set_plane_src(&mut req, video, black.width, black.height);
    video.set(&mut req, "FB_ID", black.fb_id as u64);

    if layout.use_zpos {
        let primary = &layout.osd;
        set_plane_crtc(&mut req, primary, 0, 0, hd, vd);
        primary.set(&mut req, "CRTC_ID", layout.crtc.id as u64);
        set_plane_src(&mut req, primary, osd.width, osd.height);
        primary.set(&mut req, "FB_ID", osd.fb_id as u64);
    }

    card.atomic_commit(&req, CommitFlags::ALLOW_MODESET)?;
    debug!("modeset {:?} done, zpos {}", mode, layout.use_zpos);
    Ok(())
}

/// A request for one frame cycle plus the OSD change merged into it. The
/// change only counts once the commit is accepted.
pub struct FrameRequest {
    pub req: AtomicRequest,
    osd_merged: bool,
    zpos: Option<ZposState>,
}

impl FrameRequest {
    /// Put a merged OSD change back on the surface after a rejected commit.
    pub fn restore_osd(&self, osd: &mut OsdSurface) {
        if self.osd_merged {
            osd.dirty = true;
        }
    }
}

/// Turns a chosen video buffer plus OSD state into one atomic commit and
/// waits for it to reach the screen.
pub struct Committer {
    card: Arc<dyn KmsDevice>,
    layout: DisplayLayout,
    planes: PlaneAssignment,
    zpos_state: ZposState,
    flip_timeout: Duration,
}

impl Committer {
    pub fn new(card: Arc<dyn KmsDevice>, layout: DisplayLayout, flip_timeout: Duration) -> Self {
        let planes = PlaneAssignment::from_layout(&layout);
        Self {
            card,
            layout,
            planes,
            zpos_state: ZposState::VideoOnTop,
            flip_timeout,
        }
    }

    pub fn zpos_state(&self) -> ZposState {
        self.zpos_state
    }

    fn current(&self, plane: &ObjectProps, name: &str) -> Option<u64> {
        match plane.current(self.card.as_ref(), name) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("cannot read {} of plane {}: {}", name, plane.id, e);
                None
            }
        }
    }

    /// Assemble the request for one frame cycle. Geometry is only written
    /// when it differs from what the plane has programmed.
    pub fn build(
        &self,
        target: VideoTarget,
        shape: Option<PictureShape>,
        osd: &mut OsdSurface,
    ) -> FrameRequest {
        let mut req = AtomicRequest::new();
        let mode = self.layout.mode;
        let video = &self.layout.video;

        let width = pic_width(&mode, shape);
        let src_w = self.current(video, "SRC_W").map(|v| v >> 16);
        let src_h = self.current(video, "SRC_H").map(|v| v >> 16);
        if src_w != Some(target.width as u64) || src_h != Some(target.height as u64) {
            set_plane_src(&mut req, video, target.width, target.height);
        }
        if self.current(video, "CRTC_W") != Some(width) {
            let x = (mode.hdisplay as u64 - width) / 2;
            set_plane_crtc(&mut req, video, x, 0, width, mode.vdisplay as u64);
        }
        video.set(&mut req, "FB_ID", target.fb_id as u64);

        let mut zpos = None;
        let osd_merged = osd.dirty;
        if osd.dirty {
            zpos = self.merge_osd(&mut req, osd);
            osd.dirty = false;
        }
        FrameRequest {
            req,
            osd_merged,
            zpos,
        }
    }

    /// Returns the stacking the request moves to, if zpos is in use.
    fn merge_osd(&self, req: &mut AtomicRequest, osd: &OsdSurface) -> Option<ZposState> {
        let plane = &self.layout.osd;
        let mut zpos = None;
        if self.planes.use_zpos {
            let want = ZposState::for_osd(osd.shown);
            let have = self.current(plane, "zpos").map(|z| self.planes.state_of(z));
            if have != Some(want) {
                let (video_z, osd_z) = self.planes.zpos_for(want);
                debug!("zpos -> {:?} (video {}, osd {})", want, video_z, osd_z);
                self.layout.video.set(req, "zpos", video_z);
                plane.set(req, "zpos", osd_z);
            }
            zpos = Some(want);
        }

        if osd.shown {
            if self.current(plane, "FB_ID") == Some(0) {
                let buf = &osd.buffer;
                plane.set(req, "CRTC_ID", self.layout.crtc.id as u64);
                plane.set(req, "FB_ID", buf.fb_id as u64);
                set_plane_crtc(req, plane, 0, 0, buf.width as u64, buf.height as u64);
                set_plane_src(req, plane, buf.width, buf.height);
            }
        } else if !self.planes.use_zpos {
            plane.set(req, "FB_ID", 0);
            plane.set(req, "CRTC_ID", 0);
        }
        zpos
    }

    /// Submit with a page-flip event. Failures are logged and counted; the
    /// next cycle commits as usual. The zpos state only moves on success.
    pub fn submit(&mut self, request: &FrameRequest, fb_id: u32) -> Result<(), KmsError> {
        let start = Instant::now();
        let result = self
            .card
            .atomic_commit(&request.req, CommitFlags::PAGE_FLIP_EVENT);
        metrics::histogram!(metric::COMMIT_TIME_US).record(start.elapsed().as_micros() as f64);
        match &result {
            Ok(()) => {
                if let Some(state) = request.zpos {
                    self.zpos_state = state;
                }
            }
            Err(e) => {
                metrics::counter!(metric::COMMITS_FAILED).increment(1);
                error!("cannot page flip to fb {}: {}", fb_id, e);
            }
        }
        result
    }

    /// Block until the flip requested by the last commit completes.
    pub fn wait_for_flip(&self) -> bool {
        match self.card.wait_for_flip(self.flip_timeout) {
            Ok(true) => true,
            Ok(false) => {
                debug!("no flip event within {:?}", self.flip_timeout);
                false
            }
            Err(e) => {
                error!("waiting for flip event failed: {}", e);
                false
            }
        }
    }
}
