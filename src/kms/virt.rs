//! In-memory mode-setting device.
//!
//! Emulates a card with one connector, one CRTC, a primary ARGB plane and an
//! NV12 overlay plane. Atomic commits are validated against the object
//! property tables and applied; a page flip completes one refresh interval
//! after the commit that requested it. Used by the test suite and by the
//! binary's headless mode.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use memmap2::MmapMut;
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    AtomicRequest, CardResources, CommitFlags, ConnectorInfo, CrtcInfo, DumbBuffer, EncoderInfo,
    Fourcc, FramebufferDesc, KmsDevice, KmsError, ModeInfo, ObjectKind, PlaneInfo, PlaneType,
    Property,
};

/// Shape of the emulated hardware.
#[derive(Debug, Clone)]
pub struct VirtualOptions {
    pub modes: Vec<ModeInfo>,
    /// `(primary, overlay)` zpos values. `None` removes the property and lets
    /// the primary plane scan out NV12 as well.
    pub zpos: Option<(u64, u64)>,
    pub refresh: Duration,
    pub connected: bool,
    /// Reject framebuffers registered with format modifiers.
    pub reject_modifiers: bool,
}

impl Default for VirtualOptions {
    fn default() -> Self {
        Self {
            modes: vec![
                ModeInfo::simple(1920, 1080, 60),
                ModeInfo::simple(1920, 1080, 50),
                ModeInfo::simple(1280, 720, 50),
                ModeInfo::simple(720, 576, 50),
            ],
            zpos: Some((0, 1)),
            refresh: Duration::from_millis(20),
            connected: true,
            reject_modifiers: false,
        }
    }
}

/// One applied atomic commit, with property names resolved.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub flags: CommitFlags,
    pub writes: Vec<(u32, String, u64)>,
}

impl CommitRecord {
    pub fn value(&self, object: u32, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .find(|(o, n, _)| *o == object && n == name)
            .map(|(_, _, v)| *v)
    }
}

struct Object {
    kind: ObjectKind,
    props: Vec<Property>,
}

struct State {
    objects: HashMap<u32, Object>,
    next_prop: u32,
    next_handle: u32,
    next_fb: u32,
    next_blob: u32,
    dumbs: HashMap<u32, u64>,
    handles: HashSet<u32>,
    prime: HashMap<RawFd, u32>,
    framebuffers: HashMap<u32, FramebufferDesc>,
    blobs: HashMap<u32, Vec<u8>>,
    crtc: CrtcInfo,
    commits: Vec<CommitRecord>,
    fail_commits: usize,
    flip_pending: bool,
}

impl State {
    fn add_object(&mut self, id: u32, kind: ObjectKind, props: &[(&str, u64)]) {
        let props = props
            .iter()
            .map(|&(name, value)| {
                self.next_prop += 1;
                Property {
                    id: self.next_prop,
                    name: name.to_string(),
                    value,
                }
            })
            .collect();
        self.objects.insert(id, Object { kind, props });
    }

    fn object(&self, id: u32, kind: ObjectKind) -> Result<&Object, KmsError> {
        self.objects
            .get(&id)
            .filter(|o| o.kind == kind)
            .ok_or(KmsError::UnknownObject {
                kind: kind.name(),
                id,
            })
    }

    fn value(&self, id: u32, name: &str) -> Option<u64> {
        self.objects
            .get(&id)?
            .props
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }
}

pub struct VirtualCard {
    options: VirtualOptions,
    state: Mutex<State>,
}

impl VirtualCard {
    pub const CRTC: u32 = 31;
    pub const ENCODER: u32 = 32;
    pub const CONNECTOR: u32 = 33;
    pub const PRIMARY_PLANE: u32 = 34;
    pub const OVERLAY_PLANE: u32 = 35;

    pub fn new() -> Self {
        Self::with_options(VirtualOptions::default())
    }

    pub fn with_options(options: VirtualOptions) -> Self {
        let mut state = State {
            objects: HashMap::new(),
            next_prop: 100,
            next_handle: 0,
            next_fb: 0,
            next_blob: 0,
            dumbs: HashMap::new(),
            handles: HashSet::new(),
            prime: HashMap::new(),
            framebuffers: HashMap::new(),
            blobs: HashMap::new(),
            crtc: CrtcInfo {
                id: Self::CRTC,
                fb_id: 0,
                x: 0,
                y: 0,
                mode: options.modes.first().copied(),
            },
            commits: Vec::new(),
            fail_commits: 0,
            flip_pending: false,
        };

        state.add_object(Self::CONNECTOR, ObjectKind::Connector, &[("CRTC_ID", 0), ("DPMS", 0)]);
        state.add_object(Self::CRTC, ObjectKind::Crtc, &[("ACTIVE", 0), ("MODE_ID", 0)]);
        for (plane, kind) in [
            (Self::PRIMARY_PLANE, PlaneType::Primary),
            (Self::OVERLAY_PLANE, PlaneType::Overlay),
        ] {
            let mut props = vec![
                ("type", kind.raw()),
                ("FB_ID", 0),
                ("CRTC_ID", 0),
                ("CRTC_X", 0),
                ("CRTC_Y", 0),
                ("CRTC_W", 0),
                ("CRTC_H", 0),
                ("SRC_X", 0),
                ("SRC_Y", 0),
                ("SRC_W", 0),
                ("SRC_H", 0),
            ];
            if let Some((primary, overlay)) = options.zpos {
                let z = if kind == PlaneType::Primary { primary } else { overlay };
                props.push(("zpos", z));
            }
            state.add_object(plane, ObjectKind::Plane, &props);
        }

        Self {
            options,
            state: Mutex::new(state),
        }
    }

    /// Make the next `n` atomic commits fail with `EINVAL`.
    pub fn fail_commits(&self, n: usize) {
        self.state.lock().fail_commits = n;
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.lock().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }

    /// Current value of a property on any object.
    pub fn value(&self, object: u32, name: &str) -> Option<u64> {
        self.state.lock().value(object, name)
    }

    pub fn framebuffer(&self, fb_id: u32) -> Option<FramebufferDesc> {
        self.state.lock().framebuffers.get(&fb_id).copied()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    pub fn dumb_count(&self) -> usize {
        self.state.lock().dumbs.len()
    }

    pub fn saved_crtc(&self) -> CrtcInfo {
        self.state.lock().crtc
    }

    fn einval(op: &'static str) -> KmsError {
        KmsError::ioctl(op, Errno::EINVAL)
    }

    fn plane_formats(&self, plane: u32) -> Vec<Fourcc> {
        match plane {
            Self::PRIMARY_PLANE if self.options.zpos.is_some() => vec![Fourcc::ARGB8888],
            Self::PRIMARY_PLANE => vec![Fourcc::ARGB8888, Fourcc::NV12],
            _ => vec![Fourcc::NV12, Fourcc::YUV420, Fourcc::ARGB8888],
        }
    }
}

impl Default for VirtualCard {
    fn default() -> Self {
        Self::new()
    }
}

impl KmsDevice for VirtualCard {
    fn get_cap(&self, cap: u64) -> Result<u64, KmsError> {
        Ok(match cap {
            super::cap::DUMB_BUFFER => 1,
            super::cap::PRIME => super::cap::PRIME_IMPORT | super::cap::PRIME_EXPORT,
            _ => 1,
        })
    }

    fn set_client_cap(&self, _cap: u64, _value: u64) -> Result<(), KmsError> {
        Ok(())
    }

    fn resources(&self) -> Result<CardResources, KmsError> {
        Ok(CardResources {
            crtcs: vec![Self::CRTC],
            connectors: vec![Self::CONNECTOR],
            encoders: vec![Self::ENCODER],
        })
    }

    fn connector(&self, id: u32) -> Result<ConnectorInfo, KmsError> {
        self.state.lock().object(id, ObjectKind::Connector)?;
        Ok(ConnectorInfo {
            id,
            encoder_id: Self::ENCODER,
            connected: self.options.connected,
            modes: self.options.modes.clone(),
        })
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo, KmsError> {
        if id != Self::ENCODER {
            return Err(KmsError::UnknownObject { kind: "encoder", id });
        }
        Ok(EncoderInfo {
            id,
            crtc_id: Self::CRTC,
            possible_crtcs: 1,
        })
    }

    fn crtc(&self, id: u32) -> Result<CrtcInfo, KmsError> {
        let state = self.state.lock();
        state.object(id, ObjectKind::Crtc)?;
        Ok(state.crtc)
    }

    fn set_crtc(&self, crtc: &CrtcInfo, _connectors: &[u32]) -> Result<(), KmsError> {
        let mut state = self.state.lock();
        state.object(crtc.id, ObjectKind::Crtc)?;
        debug!("virtual: set crtc {} fb {} mode {:?}", crtc.id, crtc.fb_id, crtc.mode);
        state.crtc = *crtc;
        Ok(())
    }

    fn plane_ids(&self) -> Result<Vec<u32>, KmsError> {
        Ok(vec![Self::PRIMARY_PLANE, Self::OVERLAY_PLANE])
    }

    fn plane(&self, id: u32) -> Result<PlaneInfo, KmsError> {
        let state = self.state.lock();
        state.object(id, ObjectKind::Plane)?;
        Ok(PlaneInfo {
            id,
            crtc_id: state.value(id, "CRTC_ID").unwrap_or(0) as u32,
            fb_id: state.value(id, "FB_ID").unwrap_or(0) as u32,
            possible_crtcs: 1,
            formats: self.plane_formats(id),
        })
    }

    fn properties(&self, object: u32, kind: ObjectKind) -> Result<Vec<Property>, KmsError> {
        Ok(self.state.lock().object(object, kind)?.props.clone())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, KmsError> {
        if width == 0 || height == 0 || bpp == 0 {
            return Err(Self::einval("CREATE_DUMB"));
        }
        let pitch = (width * bpp).div_ceil(8);
        let page = page_size::get() as u64;
        let size = (pitch as u64 * height as u64).div_ceil(page) * page;
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.dumbs.insert(handle, size);
        state.handles.insert(handle);
        Ok(DumbBuffer {
            handle,
            pitch,
            size,
        })
    }

    fn map_dumb(&self, handle: u32, size: u64) -> Result<MmapMut, KmsError> {
        let known = self.state.lock().dumbs.get(&handle).copied();
        match known {
            Some(alloc) if size <= alloc => Ok(MmapMut::map_anon(size as usize)?),
            _ => Err(Self::einval("MAP_DUMB")),
        }
    }

    fn destroy_dumb(&self, handle: u32) -> Result<(), KmsError> {
        let mut state = self.state.lock();
        if state.dumbs.remove(&handle).is_none() {
            return Err(KmsError::ioctl("DESTROY_DUMB", Errno::ENOENT));
        }
        state.handles.remove(&handle);
        state.prime.retain(|_, h| *h != handle);
        Ok(())
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> Result<u32, KmsError> {
        if fd < 0 {
            return Err(KmsError::ioctl("PRIME_FD_TO_HANDLE", Errno::EBADF));
        }
        let mut state = self.state.lock();
        if let Some(&handle) = state.prime.get(&fd) {
            state.handles.insert(handle);
            return Ok(handle);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.prime.insert(fd, handle);
        state.handles.insert(handle);
        Ok(handle)
    }

    fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd, KmsError> {
        let mut state = self.state.lock();
        if !state.handles.contains(&handle) {
            return Err(KmsError::ioctl("PRIME_HANDLE_TO_FD", Errno::ENOENT));
        }
        // Any open file gives the export a process-unique descriptor number.
        let fd = OwnedFd::from(File::open("/dev/null")?);
        state.prime.insert(fd.as_raw_fd(), handle);
        Ok(fd)
    }

    fn gem_close(&self, handle: u32) -> Result<(), KmsError> {
        let mut state = self.state.lock();
        if !state.handles.remove(&handle) {
            return Err(Self::einval("GEM_CLOSE"));
        }
        state.prime.retain(|_, h| *h != handle);
        Ok(())
    }

    fn add_framebuffer(&self, fb: &FramebufferDesc) -> Result<u32, KmsError> {
        if fb.modifiers.is_some() && self.options.reject_modifiers {
            return Err(Self::einval("ADDFB2"));
        }
        let mut state = self.state.lock();
        if fb.width == 0 || fb.height == 0 || !state.handles.contains(&fb.handles[0]) {
            return Err(Self::einval("ADDFB2"));
        }
        state.next_fb += 1;
        let id = state.next_fb;
        state.framebuffers.insert(id, *fb);
        trace!("virtual: fb {} {}x{} {:?}", id, fb.width, fb.height, fb.format);
        Ok(id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> Result<(), KmsError> {
        match self.state.lock().framebuffers.remove(&fb_id) {
            Some(_) => Ok(()),
            None => Err(KmsError::ioctl("RMFB", Errno::ENOENT)),
        }
    }

    fn create_blob(&self, data: &[u8]) -> Result<u32, KmsError> {
        let mut state = self.state.lock();
        state.next_blob += 1;
        let id = 1000 + state.next_blob;
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn atomic_commit(&self, req: &AtomicRequest, flags: CommitFlags) -> Result<(), KmsError> {
        let mut state = self.state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(Self::einval("ATOMIC"));
        }

        let mut resolved = Vec::with_capacity(req.len());
        for &(object, prop, value) in req.writes() {
            let obj = state
                .objects
                .get(&object)
                .ok_or_else(|| KmsError::CommitRejected(format!("unknown object {object}")))?;
            let name = obj
                .props
                .iter()
                .find(|p| p.id == prop)
                .map(|p| p.name.clone())
                .ok_or_else(|| {
                    KmsError::CommitRejected(format!("object {object} has no property {prop}"))
                })?;
            if name == "FB_ID" && value != 0 && !state.framebuffers.contains_key(&(value as u32)) {
                return Err(KmsError::CommitRejected(format!("unknown framebuffer {value}")));
            }
            if name == "MODE_ID" && value != 0 && !state.blobs.contains_key(&(value as u32)) {
                return Err(KmsError::CommitRejected(format!("unknown blob {value}")));
            }
            if name == "type" {
                return Err(KmsError::CommitRejected("plane type is immutable".into()));
            }
            resolved.push((object, name, value));
        }

        for (object, name, value) in &resolved {
            if let Some(p) = state
                .objects
                .get_mut(object)
                .and_then(|o| o.props.iter_mut().find(|p| &p.name == name))
            {
                p.value = *value;
            }
        }
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            state.flip_pending = true;
        }
        state.commits.push(CommitRecord {
            flags,
            writes: resolved,
        });
        Ok(())
    }

    fn wait_for_flip(&self, timeout: Duration) -> Result<bool, KmsError> {
        let pending = self.state.lock().flip_pending;
        if !pending {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        std::thread::sleep(self.options.refresh.min(timeout));
        self.state.lock().flip_pending = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::ObjectProps;

    #[test]
    fn commit_applies_and_logs() {
        let card = VirtualCard::new();
        let overlay = ObjectProps::load(&card, VirtualCard::OVERLAY_PLANE, ObjectKind::Plane).unwrap();
        let mut req = AtomicRequest::new();
        overlay.set(&mut req, "zpos", 3);
        card.atomic_commit(&req, CommitFlags::PAGE_FLIP_EVENT).unwrap();

        assert_eq!(card.value(VirtualCard::OVERLAY_PLANE, "zpos"), Some(3));
        assert_eq!(card.commits()[0].value(VirtualCard::OVERLAY_PLANE, "zpos"), Some(3));
        assert!(card.wait_for_flip(Duration::from_millis(100)).unwrap());
        assert!(!card.wait_for_flip(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn unknown_framebuffer_is_rejected() {
        let card = VirtualCard::new();
        let overlay = ObjectProps::load(&card, VirtualCard::OVERLAY_PLANE, ObjectKind::Plane).unwrap();
        let mut req = AtomicRequest::new();
        overlay.set(&mut req, "FB_ID", 77);
        assert!(matches!(
            card.atomic_commit(&req, CommitFlags::default()),
            Err(KmsError::CommitRejected(_))
        ));
        assert_eq!(card.commit_count(), 0);
    }

    #[test]
    fn exported_fd_maps_back_to_its_handle() {
        let card = VirtualCard::new();
        let dumb = card.create_dumb(64, 64, 12).unwrap();
        let fd = card.prime_handle_to_fd(dumb.handle).unwrap();
        assert_eq!(card.prime_fd_to_handle(fd.as_raw_fd()).unwrap(), dumb.handle);
        card.destroy_dumb(dumb.handle).unwrap();
        assert!(card.destroy_dumb(dumb.handle).is_err());
    }

    #[test]
    fn modifiers_can_be_refused() {
        let card = VirtualCard::with_options(VirtualOptions {
            reject_modifiers: true,
            ..Default::default()
        });
        let dumb = card.create_dumb(16, 16, 32).unwrap();
        let mut fb = FramebufferDesc {
            width: 16,
            height: 16,
            format: Fourcc::ARGB8888,
            handles: [dumb.handle, 0, 0, 0],
            pitches: [dumb.pitch, 0, 0, 0],
            offsets: [0; 4],
            modifiers: Some([0; 4]),
        };
        assert!(card.add_framebuffer(&fb).is_err());
        fb.modifiers = None;
        assert!(card.add_framebuffer(&fb).is_ok());
    }
}
