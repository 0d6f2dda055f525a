//! DRM card node backend.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, instrument, trace};

use super::ioctl::*;
use super::{
    AtomicRequest, CardResources, CommitFlags, ConnectorInfo, CrtcInfo, DumbBuffer, EncoderInfo,
    Fourcc, FramebufferDesc, KmsDevice, KmsError, ModeInfo, ObjectKind, PlaneInfo, Property,
    MODE_CONNECTED,
};

/// An opened `/dev/dri/cardN` node.
pub struct DrmCard {
    file: File,
    path: PathBuf,
}

/// Retry an ioctl while it is interrupted, as `drmIoctl` does.
fn retry<F>(op: &'static str, mut f: F) -> Result<(), KmsError>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    loop {
        match f() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(KmsError::ioctl(op, e)),
        }
    }
}

fn ptr<T>(v: &mut [T]) -> u64 {
    v.as_mut_ptr() as u64
}

fn cstr_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl DrmCard {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KmsError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("Opened DRM node {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn object_properties(&self, object: u32, kind: ObjectKind) -> Result<(Vec<u32>, Vec<u64>), KmsError> {
        // Count first, then fetch; retry if the set changed in between.
        loop {
            let mut arg = drm_mode_obj_get_properties {
                obj_id: object,
                obj_type: kind.raw(),
                ..Default::default()
            };
            retry("OBJ_GETPROPERTIES", || unsafe {
                drm_mode_obj_getproperties(self.fd(), &mut arg)
            })?;
            let count = arg.count_props as usize;
            let mut ids = vec![0u32; count];
            let mut values = vec![0u64; count];
            arg.props_ptr = ptr(&mut ids);
            arg.prop_values_ptr = ptr(&mut values);
            retry("OBJ_GETPROPERTIES", || unsafe {
                drm_mode_obj_getproperties(self.fd(), &mut arg)
            })?;
            if arg.count_props as usize == count {
                return Ok((ids, values));
            }
        }
    }

    fn property_name(&self, prop_id: u32) -> Result<String, KmsError> {
        let mut arg = drm_mode_get_property {
            prop_id,
            ..Default::default()
        };
        retry("GETPROPERTY", || unsafe { drm_mode_getproperty(self.fd(), &mut arg) })?;
        Ok(cstr_name(&arg.name))
    }
}

impl KmsDevice for DrmCard {
    fn get_cap(&self, cap: u64) -> Result<u64, KmsError> {
        let mut arg = drm_get_cap {
            capability: cap,
            value: 0,
        };
        retry("GET_CAP", || unsafe { drm_get_cap_ioctl(self.fd(), &mut arg) })?;
        Ok(arg.value)
    }

    fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), KmsError> {
        let arg = drm_set_client_cap {
            capability: cap,
            value,
        };
        retry("SET_CLIENT_CAP", || unsafe {
            drm_set_client_cap_ioctl(self.fd(), &arg)
        })
    }

    fn resources(&self) -> Result<CardResources, KmsError> {
        loop {
            let mut arg = drm_mode_card_res::default();
            retry("GETRESOURCES", || unsafe { drm_mode_getresources(self.fd(), &mut arg) })?;
            let (nfb, ncrtc, nconn, nenc) = (
                arg.count_fbs,
                arg.count_crtcs,
                arg.count_connectors,
                arg.count_encoders,
            );
            let mut fbs = vec![0u32; nfb as usize];
            let mut crtcs = vec![0u32; ncrtc as usize];
            let mut connectors = vec![0u32; nconn as usize];
            let mut encoders = vec![0u32; nenc as usize];
            arg.fb_id_ptr = ptr(&mut fbs);
            arg.crtc_id_ptr = ptr(&mut crtcs);
            arg.connector_id_ptr = ptr(&mut connectors);
            arg.encoder_id_ptr = ptr(&mut encoders);
            retry("GETRESOURCES", || unsafe { drm_mode_getresources(self.fd(), &mut arg) })?;
            if (arg.count_fbs, arg.count_crtcs, arg.count_connectors, arg.count_encoders)
                == (nfb, ncrtc, nconn, nenc)
            {
                return Ok(CardResources {
                    crtcs,
                    connectors,
                    encoders,
                });
            }
        }
    }

    fn connector(&self, id: u32) -> Result<ConnectorInfo, KmsError> {
        loop {
            let mut arg = drm_mode_get_connector {
                connector_id: id,
                ..Default::default()
            };
            retry("GETCONNECTOR", || unsafe { drm_mode_getconnector(self.fd(), &mut arg) })?;
            let (nmodes, nprops, nenc) = (arg.count_modes, arg.count_props, arg.count_encoders);
            let mut modes = vec![ModeInfo::default(); nmodes as usize];
            let mut props = vec![0u32; nprops as usize];
            let mut values = vec![0u64; nprops as usize];
            let mut encoders = vec![0u32; nenc as usize];
            arg.modes_ptr = ptr(&mut modes);
            arg.props_ptr = ptr(&mut props);
            arg.prop_values_ptr = ptr(&mut values);
            arg.encoders_ptr = ptr(&mut encoders);
            retry("GETCONNECTOR", || unsafe { drm_mode_getconnector(self.fd(), &mut arg) })?;
            if (arg.count_modes, arg.count_props, arg.count_encoders) == (nmodes, nprops, nenc) {
                return Ok(ConnectorInfo {
                    id,
                    encoder_id: arg.encoder_id,
                    connected: arg.connection == MODE_CONNECTED,
                    modes,
                });
            }
        }
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo, KmsError> {
        let mut arg = drm_mode_get_encoder {
            encoder_id: id,
            ..Default::default()
        };
        retry("GETENCODER", || unsafe { drm_mode_getencoder(self.fd(), &mut arg) })?;
        Ok(EncoderInfo {
            id,
            crtc_id: arg.crtc_id,
            possible_crtcs: arg.possible_crtcs,
        })
    }

    fn crtc(&self, id: u32) -> Result<CrtcInfo, KmsError> {
        let mut arg = drm_mode_crtc {
            crtc_id: id,
            ..Default::default()
        };
        retry("GETCRTC", || unsafe { drm_mode_getcrtc(self.fd(), &mut arg) })?;
        Ok(CrtcInfo {
            id,
            fb_id: arg.fb_id,
            x: arg.x,
            y: arg.y,
            mode: (arg.mode_valid != 0).then_some(arg.mode),
        })
    }

    fn set_crtc(&self, crtc: &CrtcInfo, connectors: &[u32]) -> Result<(), KmsError> {
        let mut ids = connectors.to_vec();
        let mut arg = drm_mode_crtc {
            set_connectors_ptr: ptr(&mut ids),
            count_connectors: ids.len() as u32,
            crtc_id: crtc.id,
            fb_id: crtc.fb_id,
            x: crtc.x,
            y: crtc.y,
            mode_valid: crtc.mode.is_some() as u32,
            mode: crtc.mode.unwrap_or_default(),
            ..Default::default()
        };
        retry("SETCRTC", || unsafe { drm_mode_setcrtc(self.fd(), &mut arg) })
    }

    fn plane_ids(&self) -> Result<Vec<u32>, KmsError> {
        loop {
            let mut arg = drm_mode_get_plane_res::default();
            retry("GETPLANERESOURCES", || unsafe {
                drm_mode_getplaneresources(self.fd(), &mut arg)
            })?;
            let count = arg.count_planes;
            let mut ids = vec![0u32; count as usize];
            arg.plane_id_ptr = ptr(&mut ids);
            retry("GETPLANERESOURCES", || unsafe {
                drm_mode_getplaneresources(self.fd(), &mut arg)
            })?;
            if arg.count_planes == count {
                return Ok(ids);
            }
        }
    }

    fn plane(&self, id: u32) -> Result<PlaneInfo, KmsError> {
        let mut arg = drm_mode_get_plane {
            plane_id: id,
            ..Default::default()
        };
        retry("GETPLANE", || unsafe { drm_mode_getplane(self.fd(), &mut arg) })?;
        let mut formats = vec![0u32; arg.count_format_types as usize];
        arg.format_type_ptr = ptr(&mut formats);
        retry("GETPLANE", || unsafe { drm_mode_getplane(self.fd(), &mut arg) })?;
        formats.truncate(arg.count_format_types as usize);
        Ok(PlaneInfo {
            id,
            crtc_id: arg.crtc_id,
            fb_id: arg.fb_id,
            possible_crtcs: arg.possible_crtcs,
            formats: formats.into_iter().map(Fourcc).collect(),
        })
    }

    fn properties(&self, object: u32, kind: ObjectKind) -> Result<Vec<Property>, KmsError> {
        let (ids, values) = self.object_properties(object, kind)?;
        ids.into_iter()
            .zip(values)
            .map(|(id, value)| {
                Ok(Property {
                    id,
                    name: self.property_name(id)?,
                    value,
                })
            })
            .collect()
    }

    fn property_value(
        &self,
        object: u32,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Option<u64>, KmsError> {
        let (ids, values) = self.object_properties(object, kind)?;
        for (id, value) in ids.into_iter().zip(values) {
            if self.property_name(id)? == name {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, KmsError> {
        let mut arg = drm_mode_create_dumb {
            width,
            height,
            bpp,
            ..Default::default()
        };
        retry("CREATE_DUMB", || unsafe {
            drm_mode_create_dumb_ioctl(self.fd(), &mut arg)
        })?;
        Ok(DumbBuffer {
            handle: arg.handle,
            pitch: arg.pitch,
            size: arg.size,
        })
    }

    fn map_dumb(&self, handle: u32, size: u64) -> Result<MmapMut, KmsError> {
        let mut arg = drm_mode_map_dumb {
            handle,
            ..Default::default()
        };
        retry("MAP_DUMB", || unsafe { drm_mode_map_dumb_ioctl(self.fd(), &mut arg) })?;
        // SAFETY: the kernel hands out a fake offset valid for this handle on
        // this fd; the mapping is unmapped before the dumb buffer is destroyed.
        let map = unsafe {
            MmapOptions::new()
                .offset(arg.offset)
                .len(size as usize)
                .map_mut(&self.file)?
        };
        Ok(map)
    }

    fn destroy_dumb(&self, handle: u32) -> Result<(), KmsError> {
        let mut arg = drm_mode_destroy_dumb { handle };
        retry("DESTROY_DUMB", || unsafe {
            drm_mode_destroy_dumb_ioctl(self.fd(), &mut arg)
        })
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> Result<u32, KmsError> {
        let mut arg = drm_prime_handle {
            fd,
            ..Default::default()
        };
        retry("PRIME_FD_TO_HANDLE", || unsafe {
            drm_prime_fd_to_handle(self.fd(), &mut arg)
        })?;
        Ok(arg.handle)
    }

    fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd, KmsError> {
        let mut arg = drm_prime_handle {
            handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        retry("PRIME_HANDLE_TO_FD", || unsafe {
            drm_prime_handle_to_fd(self.fd(), &mut arg)
        })?;
        // SAFETY: the kernel just created this fd for us and nobody else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(arg.fd) })
    }

    fn gem_close(&self, handle: u32) -> Result<(), KmsError> {
        let arg = drm_gem_close { handle, pad: 0 };
        retry("GEM_CLOSE", || unsafe { drm_gem_close_ioctl(self.fd(), &arg) })
    }

    fn add_framebuffer(&self, fb: &FramebufferDesc) -> Result<u32, KmsError> {
        let mut arg = drm_mode_fb_cmd2 {
            width: fb.width,
            height: fb.height,
            pixel_format: fb.format.0,
            handles: fb.handles,
            pitches: fb.pitches,
            offsets: fb.offsets,
            ..Default::default()
        };
        if let Some(modifiers) = fb.modifiers {
            arg.flags = DRM_MODE_FB_MODIFIERS;
            arg.modifier = modifiers;
        }
        retry("ADDFB2", || unsafe { drm_mode_addfb2(self.fd(), &mut arg) })?;
        Ok(arg.fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> Result<(), KmsError> {
        let mut id = fb_id;
        retry("RMFB", || unsafe { drm_mode_rmfb(self.fd(), &mut id) })
    }

    fn create_blob(&self, data: &[u8]) -> Result<u32, KmsError> {
        let mut arg = drm_mode_create_blob {
            data: data.as_ptr() as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        retry("CREATEPROPBLOB", || unsafe {
            drm_mode_createpropblob(self.fd(), &mut arg)
        })?;
        Ok(arg.blob_id)
    }

    fn atomic_commit(&self, req: &AtomicRequest, flags: CommitFlags) -> Result<(), KmsError> {
        let groups = req.grouped();
        let mut objs: Vec<u32> = groups.iter().map(|(o, _)| *o).collect();
        let mut counts: Vec<u32> = groups.iter().map(|(_, p)| p.len() as u32).collect();
        let mut props: Vec<u32> = groups
            .iter()
            .flat_map(|(_, p)| p.iter().map(|(id, _)| *id))
            .collect();
        let mut values: Vec<u64> = groups
            .iter()
            .flat_map(|(_, p)| p.iter().map(|(_, v)| *v))
            .collect();
        let mut arg = drm_mode_atomic {
            flags: flags.0,
            count_objs: objs.len() as u32,
            objs_ptr: ptr(&mut objs),
            count_props_ptr: ptr(&mut counts),
            props_ptr: ptr(&mut props),
            prop_values_ptr: ptr(&mut values),
            ..Default::default()
        };
        trace!("atomic commit: {} objects, {} props", objs.len(), props.len());
        retry("ATOMIC", || unsafe { drm_mode_atomic_ioctl(self.fd(), &mut arg) })
    }

    #[instrument(level = "trace", skip(self))]
    fn wait_for_flip(&self, timeout: Duration) -> Result<bool, KmsError> {
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let ready = match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(KmsError::ioctl("poll", e)),
        };
        if ready == 0 {
            return Ok(false);
        }

        let mut buf = [0u8; 1024];
        let len = (&self.file).read(&mut buf)?;
        let header = std::mem::size_of::<drm_event>();
        let mut offset = 0;
        let mut flipped = false;
        while offset + header <= len {
            // SAFETY: bounds checked above; drm_event is two plain u32s.
            let event: drm_event =
                unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr().cast()) };
            if event.type_ == DRM_EVENT_FLIP_COMPLETE {
                flipped = true;
            }
            if event.length == 0 {
                break;
            }
            offset += event.length as usize;
        }
        Ok(flipped)
    }
}
