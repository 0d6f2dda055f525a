use tracing::trace;

use super::buffer::ScanoutBuffer;

/// The ARGB8888 buffer behind the OSD plane and its pending state.
#[derive(Debug)]
pub struct OsdSurface {
    pub buffer: ScanoutBuffer,
    /// Drawn to since the last commit.
    pub dirty: bool,
    pub shown: bool,
}

impl OsdSurface {
    pub fn new(buffer: ScanoutBuffer) -> Self {
        Self {
            buffer,
            dirty: false,
            shown: false,
        }
    }

    pub fn clear(&mut self) {
        if let Some(pixels) = self.buffer.pixels_mut() {
            pixels.fill(0);
        }
        self.dirty = true;
        self.shown = false;
    }

    /// Copy a `width`x`height` rectangle starting at (`x`, `y`) of an ARGB
    /// image with row pitch `pitch` to (`dst_x`, `dst_y`) on the OSD.
    /// Anything falling outside either image is clipped.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_argb(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pitch: usize,
        argb: &[u8],
        dst_x: u32,
        dst_y: u32,
    ) {
        let (osd_w, osd_h, osd_pitch) = (
            self.buffer.width as usize,
            self.buffer.height as usize,
            self.buffer.pitches[0] as usize,
        );
        let cols = (width as usize)
            .min(osd_w.saturating_sub(dst_x as usize))
            .min((pitch / 4).saturating_sub(x as usize));
        let rows = (height as usize).min(osd_h.saturating_sub(dst_y as usize));
        trace!("osd draw {}x{} at {},{}", cols, rows, dst_x, dst_y);

        if let Some(pixels) = self.buffer.pixels_mut() {
            for row in 0..rows {
                let src = (y as usize + row) * pitch + x as usize * 4;
                let dst = (dst_y as usize + row) * osd_pitch + dst_x as usize * 4;
                let (Some(src), Some(dst)) = (
                    argb.get(src..src + cols * 4),
                    pixels.get_mut(dst..dst + cols * 4),
                ) else {
                    break;
                };
                dst.copy_from_slice(src);
            }
        }
        self.dirty = true;
        self.shown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::{Fourcc, VirtualCard};

    fn osd(card: &VirtualCard) -> OsdSurface {
        OsdSurface::new(ScanoutBuffer::create(card, 8, 4, Fourcc::ARGB8888, None).unwrap())
    }

    #[test]
    fn draw_copies_and_marks_shown() {
        let card = VirtualCard::new();
        let mut osd = osd(&card);
        let image = vec![0xffu8; 2 * 2 * 4];
        osd.draw_argb(0, 0, 2, 2, 8, &image, 1, 1);
        assert!(osd.dirty && osd.shown);

        let pitch = osd.buffer.pitches[0] as usize;
        let pixels = osd.buffer.pixels_mut().unwrap();
        assert_eq!(pixels[pitch + 4], 0xff);
        assert_eq!(pixels[pitch], 0);
        assert_eq!(pixels[3 * pitch + 4], 0);
    }

    #[test]
    fn draw_clips_at_the_edge() {
        let card = VirtualCard::new();
        let mut osd = osd(&card);
        let image = vec![0xffu8; 4 * 4 * 4];
        osd.draw_argb(0, 0, 4, 4, 16, &image, 6, 2);
        let pitch = osd.buffer.pitches[0] as usize;
        let pixels = osd.buffer.pixels_mut().unwrap();
        assert_eq!(pixels[3 * pitch + 7 * 4], 0xff);
    }

    #[test]
    fn clear_hides() {
        let card = VirtualCard::new();
        let mut osd = osd(&card);
        osd.draw_argb(0, 0, 1, 1, 4, &[1, 2, 3, 4], 0, 0);
        osd.clear();
        assert!(osd.dirty && !osd.shown);
        assert_eq!(osd.buffer.pixels_mut().unwrap()[0], 0);
    }
}
