//! Connector, mode and plane selection.

use tracing::{debug, info, instrument, warn};

use super::{
    cap, client_cap, Fourcc, KmsDevice, KmsError, ModeInfo, ObjectKind, ObjectProps, PlaneType,
};
use crate::ModePreference;

/// Everything the renderer needs to know about the output it drives.
#[derive(Debug, Clone)]
pub struct DisplayLayout {
    pub connector: ObjectProps,
    pub crtc: ObjectProps,
    pub mode: ModeInfo,
    /// Plane showing the video, NV12 capable.
    pub video: ObjectProps,
    /// Plane showing the OSD, ARGB8888 capable.
    pub osd: ObjectProps,
    /// Both planes expose `zpos`, so they trade places instead of toggling
    /// the OSD plane on and off.
    pub use_zpos: bool,
    pub zpos_primary: u64,
    pub zpos_overlay: u64,
}

/// Check the capabilities the renderer depends on and switch the client
/// into atomic mode.
pub fn check_caps(card: &dyn KmsDevice) -> Result<(), KmsError> {
    if card.get_cap(cap::DUMB_BUFFER)? == 0 {
        return Err(KmsError::Unsupported("dumb buffers"));
    }
    card.set_client_cap(client_cap::UNIVERSAL_PLANES, 1)?;
    card.set_client_cap(client_cap::ATOMIC, 1)?;
    card.get_cap(cap::PRIME)?;
    Ok(())
}

/// First mode matching the preference list, earlier entries win.
pub fn select_mode(modes: &[ModeInfo], prefs: &[ModePreference]) -> Option<ModeInfo> {
    prefs.iter().find_map(|pref| {
        modes.iter().copied().find(|m| {
            m.hdisplay as u32 == pref.width
                && m.vdisplay as u32 == pref.height
                && m.vrefresh == pref.refresh
                && !m.is_interlaced()
        })
    })
}

/// Move the zpos values into the order the renderer relies on: the overlay
/// plane must start above the primary one.
pub fn fix_zpos(primary: u64, overlay: u64) -> (u64, u64) {
    if overlay > primary {
        (primary, overlay)
    } else if overlay == primary {
        (0, 1)
    } else {
        (overlay, primary)
    }
}

impl DisplayLayout {
    #[instrument(level = "debug", skip(card))]
    pub fn probe(card: &dyn KmsDevice, prefs: &[ModePreference]) -> Result<Self, KmsError> {
        let res = card.resources()?;
        debug!(
            "{} connectors, {} crtcs, {} encoders",
            res.connectors.len(),
            res.crtcs.len(),
            res.encoders.len()
        );

        let mut found = None;
        for &id in &res.connectors {
            let conn = card.connector(id)?;
            if conn.connected && !conn.modes.is_empty() {
                found = Some(conn);
                break;
            }
        }
        let conn = found.ok_or(KmsError::NoConnector)?;
        let encoder = card.encoder(conn.encoder_id)?;

        let mode = select_mode(&conn.modes, prefs).ok_or(KmsError::NoMode)?;
        info!("Found monitor mode {:?} on connector {}", mode, conn.id);

        let mut video: Option<(u32, PlaneType)> = None;
        let mut osd: Option<(u32, PlaneType)> = None;
        let planes = card
            .plane_ids()?
            .into_iter()
            .map(|id| card.plane(id))
            .collect::<Result<Vec<_>, _>>()?;
        let typed = planes
            .into_iter()
            .filter(|p| p.possible_crtcs & encoder.possible_crtcs != 0)
            .map(|p| {
                let kind = card
                    .property_value(p.id, ObjectKind::Plane, "type")?
                    .map(PlaneType::from_raw)
                    .unwrap_or(PlaneType::Overlay);
                Ok((p, kind))
            })
            .collect::<Result<Vec<_>, KmsError>>()?;

        for (plane, kind) in &typed {
            debug!("plane {} {:?} formats {:?}", plane.id, kind, plane.formats);
            if video.is_none() && plane.formats.contains(&Fourcc::NV12) {
                video = Some((plane.id, *kind));
            }
        }
        let (video_id, video_kind) = video.ok_or(KmsError::NoPlane("NV12"))?;
        for (plane, kind) in &typed {
            if osd.is_none() && plane.id != video_id && plane.formats.contains(&Fourcc::ARGB8888) {
                osd = Some((plane.id, *kind));
            }
        }
        let (osd_id, osd_kind) = osd.ok_or(KmsError::NoPlane("ARGB8888"))?;

        let mut use_zpos = false;
        let mut zpos_overlay = 0;
        let mut zpos_primary = 0;
        if video_kind != PlaneType::Primary {
            if let Some(z) = card.property_value(video_id, ObjectKind::Plane, "zpos")? {
                zpos_overlay = z;
                use_zpos = true;
            }
        }
        if osd_kind != PlaneType::Overlay {
            if let Some(z) = card.property_value(osd_id, ObjectKind::Plane, "zpos")? {
                zpos_primary = z;
                use_zpos = true;
            }
        }
        if use_zpos && zpos_overlay <= zpos_primary {
            warn!(
                "zpos values out of order (primary {}, overlay {}), fixing up",
                zpos_primary, zpos_overlay
            );
            (zpos_primary, zpos_overlay) = fix_zpos(zpos_primary, zpos_overlay);
        }

        info!(
            "Video plane {} ({:?}), OSD plane {} ({:?}), crtc {}, zpos {}",
            video_id,
            video_kind,
            osd_id,
            osd_kind,
            encoder.crtc_id,
            if use_zpos {
                format!("{zpos_primary}/{zpos_overlay}")
            } else {
                "off".to_string()
            }
        );

        Ok(Self {
            connector: ObjectProps::load(card, conn.id, ObjectKind::Connector)?,
            crtc: ObjectProps::load(card, encoder.crtc_id, ObjectKind::Crtc)?,
            mode,
            video: ObjectProps::load(card, video_id, ObjectKind::Plane)?,
            osd: ObjectProps::load(card, osd_id, ObjectKind::Plane)?,
            use_zpos,
            zpos_primary,
            zpos_overlay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::virt::{VirtualCard, VirtualOptions};

    fn prefs() -> Vec<ModePreference> {
        crate::DeviceConfig::default().modes
    }

    #[test]
    fn prefers_1080p50_over_listing_order() {
        let card = VirtualCard::new();
        let layout = DisplayLayout::probe(&card, &prefs()).unwrap();
        assert_eq!(layout.mode.hdisplay, 1920);
        assert_eq!(layout.mode.vrefresh, 50);
        assert_eq!(layout.video.id, VirtualCard::OVERLAY_PLANE);
        assert_eq!(layout.osd.id, VirtualCard::PRIMARY_PLANE);
        assert!(layout.use_zpos);
        assert_eq!((layout.zpos_primary, layout.zpos_overlay), (0, 1));
    }

    #[test]
    fn falls_back_down_the_preference_list() {
        let card = VirtualCard::with_options(VirtualOptions {
            modes: vec![ModeInfo::simple(1280, 720, 60), ModeInfo::simple(1024, 768, 60)],
            ..Default::default()
        });
        let layout = DisplayLayout::probe(&card, &prefs()).unwrap();
        assert_eq!((layout.mode.hdisplay, layout.mode.vrefresh), (1280, 60));
    }

    #[test]
    fn no_matching_mode_is_fatal() {
        let card = VirtualCard::with_options(VirtualOptions {
            modes: vec![ModeInfo::simple(1024, 768, 60)],
            ..Default::default()
        });
        assert!(matches!(
            DisplayLayout::probe(&card, &prefs()),
            Err(KmsError::NoMode)
        ));
    }

    #[test]
    fn disconnected_output_is_fatal() {
        let card = VirtualCard::with_options(VirtualOptions {
            connected: false,
            ..Default::default()
        });
        assert!(matches!(
            DisplayLayout::probe(&card, &prefs()),
            Err(KmsError::NoConnector)
        ));
    }

    #[test]
    fn without_zpos_video_takes_the_primary_plane() {
        let card = VirtualCard::with_options(VirtualOptions {
            zpos: None,
            ..Default::default()
        });
        let layout = DisplayLayout::probe(&card, &prefs()).unwrap();
        assert!(!layout.use_zpos);
        assert_eq!(layout.video.id, VirtualCard::PRIMARY_PLANE);
        assert_eq!(layout.osd.id, VirtualCard::OVERLAY_PLANE);
    }

    #[test]
    fn inverted_zpos_is_swapped() {
        let card = VirtualCard::with_options(VirtualOptions {
            zpos: Some((2, 1)),
            ..Default::default()
        });
        let layout = DisplayLayout::probe(&card, &prefs()).unwrap();
        assert_eq!((layout.zpos_primary, layout.zpos_overlay), (1, 2));
    }

    #[test]
    fn zpos_fix_up() {
        assert_eq!(fix_zpos(0, 1), (0, 1));
        assert_eq!(fix_zpos(3, 3), (0, 1));
        assert_eq!(fix_zpos(2, 1), (1, 2));
    }
}
