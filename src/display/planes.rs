//! Video/OSD plane stacking.
//!
//! When the hardware only scans out ARGB on the primary plane and NV12 on an
//! overlay, the OSD cannot move planes. Instead the two planes swap zpos:
//! video above the OSD while nothing is drawn, OSD above the video while it
//! shows something.

use crate::kms::DisplayLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZposState {
    VideoOnTop,
    OsdOnTop,
}

impl ZposState {
    pub fn for_osd(shown: bool) -> Self {
        if shown {
            ZposState::OsdOnTop
        } else {
            ZposState::VideoOnTop
        }
    }
}

/// Zpos values of the video and OSD planes.
#[derive(Debug, Clone, Copy)]
pub struct PlaneAssignment {
    pub use_zpos: bool,
    pub zpos_primary: u64,
    pub zpos_overlay: u64,
}

impl PlaneAssignment {
    pub fn from_layout(layout: &DisplayLayout) -> Self {
        Self {
            use_zpos: layout.use_zpos,
            zpos_primary: layout.zpos_primary,
            zpos_overlay: layout.zpos_overlay,
        }
    }

    /// `(video, osd)` zpos values for a state.
    pub fn zpos_for(&self, state: ZposState) -> (u64, u64) {
        match state {
            ZposState::VideoOnTop => (self.zpos_overlay, self.zpos_primary),
            ZposState::OsdOnTop => (self.zpos_primary, self.zpos_overlay),
        }
    }

    /// The state the hardware is in, judged by the OSD plane's zpos.
    pub fn state_of(&self, osd_zpos: u64) -> ZposState {
        if osd_zpos == self.zpos_overlay {
            ZposState::OsdOnTop
        } else {
            ZposState::VideoOnTop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planes() -> PlaneAssignment {
        PlaneAssignment {
            use_zpos: true,
            zpos_primary: 0,
            zpos_overlay: 1,
        }
    }

    #[test]
    fn states_swap_values() {
        let p = planes();
        assert_eq!(p.zpos_for(ZposState::VideoOnTop), (1, 0));
        assert_eq!(p.zpos_for(ZposState::OsdOnTop), (0, 1));
    }

    #[test]
    fn state_round_trips_through_osd_zpos() {
        let p = planes();
        for state in [ZposState::VideoOnTop, ZposState::OsdOnTop] {
            let (_, osd) = p.zpos_for(state);
            assert_eq!(p.state_of(osd), state);
        }
        assert_eq!(ZposState::for_osd(true), ZposState::OsdOnTop);
    }
}
