//! Raw DRM ioctl definitions, mirroring `<drm/drm.h>` and `<drm/drm_mode.h>`.

#![allow(non_camel_case_types)]

use nix::{ioctl_readwrite, ioctl_write_ptr};

use super::ModeInfo;

const DRM_IOCTL_BASE: u8 = b'd';

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_get_cap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_set_client_cap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_card_res {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_crtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: ModeInfo,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_encoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_connector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_property {
    pub values_ptr: u64,
    pub enum_blob_ptr: u64,
    pub prop_id: u32,
    pub flags: u32,
    pub name: [u8; 32],
    pub count_values: u32,
    pub count_enum_blobs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_obj_get_properties {
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_props: u32,
    pub obj_id: u32,
    pub obj_type: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_create_dumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_map_dumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_destroy_dumb {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_plane_res {
    pub plane_id_ptr: u64,
    pub count_planes: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_plane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
    pub count_format_types: u32,
    pub format_type_ptr: u64,
}

pub const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_fb_cmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_atomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_create_blob {
    pub data: u64,
    pub length: u32,
    pub blob_id: u32,
}

pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

/// Header shared by every event read from the device fd.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_event {
    pub type_: u32,
    pub length: u32,
}

ioctl_readwrite!(drm_get_cap_ioctl, DRM_IOCTL_BASE, 0x0c, drm_get_cap);
ioctl_write_ptr!(drm_set_client_cap_ioctl, DRM_IOCTL_BASE, 0x0d, drm_set_client_cap);
ioctl_write_ptr!(drm_gem_close_ioctl, DRM_IOCTL_BASE, 0x09, drm_gem_close);
ioctl_readwrite!(drm_prime_handle_to_fd, DRM_IOCTL_BASE, 0x2d, drm_prime_handle);
ioctl_readwrite!(drm_prime_fd_to_handle, DRM_IOCTL_BASE, 0x2e, drm_prime_handle);
ioctl_readwrite!(drm_mode_getresources, DRM_IOCTL_BASE, 0xa0, drm_mode_card_res);
ioctl_readwrite!(drm_mode_getcrtc, DRM_IOCTL_BASE, 0xa1, drm_mode_crtc);
ioctl_readwrite!(drm_mode_setcrtc, DRM_IOCTL_BASE, 0xa2, drm_mode_crtc);
ioctl_readwrite!(drm_mode_getencoder, DRM_IOCTL_BASE, 0xa6, drm_mode_get_encoder);
ioctl_readwrite!(drm_mode_getconnector, DRM_IOCTL_BASE, 0xa7, drm_mode_get_connector);
ioctl_readwrite!(drm_mode_getproperty, DRM_IOCTL_BASE, 0xaa, drm_mode_get_property);
ioctl_readwrite!(drm_mode_rmfb, DRM_IOCTL_BASE, 0xaf, u32);
ioctl_readwrite!(drm_mode_create_dumb_ioctl, DRM_IOCTL_BASE, 0xb2, drm_mode_create_dumb);
ioctl_readwrite!(drm_mode_map_dumb_ioctl, DRM_IOCTL_BASE, 0xb3, drm_mode_map_dumb);
ioctl_readwrite!(drm_mode_destroy_dumb_ioctl, DRM_IOCTL_BASE, 0xb4, drm_mode_destroy_dumb);
ioctl_readwrite!(drm_mode_getplaneresources, DRM_IOCTL_BASE, 0xb5, drm_mode_get_plane_res);
ioctl_readwrite!(drm_mode_getplane, DRM_IOCTL_BASE, 0xb6, drm_mode_get_plane);
ioctl_readwrite!(drm_mode_addfb2, DRM_IOCTL_BASE, 0xb8, drm_mode_fb_cmd2);
ioctl_readwrite!(drm_mode_obj_getproperties, DRM_IOCTL_BASE, 0xb9, drm_mode_obj_get_properties);
ioctl_readwrite!(drm_mode_atomic_ioctl, DRM_IOCTL_BASE, 0xbc, drm_mode_atomic);
ioctl_readwrite!(drm_mode_createpropblob, DRM_IOCTL_BASE, 0xbd, drm_mode_create_blob);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes_match_uapi() {
        assert_eq!(size_of::<drm_mode_card_res>(), 64);
        assert_eq!(size_of::<drm_mode_crtc>(), 104);
        assert_eq!(size_of::<drm_mode_get_connector>(), 80);
        assert_eq!(size_of::<drm_mode_get_property>(), 64);
        assert_eq!(size_of::<drm_mode_create_dumb>(), 32);
        assert_eq!(size_of::<drm_mode_get_plane_res>(), 16);
        assert_eq!(size_of::<drm_mode_get_plane>(), 32);
        assert_eq!(size_of::<drm_mode_fb_cmd2>(), 104);
        assert_eq!(size_of::<drm_mode_obj_get_properties>(), 32);
        assert_eq!(size_of::<drm_mode_atomic>(), 56);
        assert_eq!(size_of::<drm_mode_create_blob>(), 16);
    }
}
