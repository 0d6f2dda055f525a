use bytes::Bytes;

use crate::video::{Frame, PlanarFormat, Rational};

/// 90 kHz, as in MPEG transport streams.
pub const TIME_BASE: Rational = Rational::new(1, 90_000);

/// Synthetic decoder output: a white bar sweeping across a grey picture.
#[derive(Debug, Clone)]
pub struct TestPattern {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub interlaced: bool,
    pub format: PlanarFormat,
    index: u64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width & !1,
            height: height & !1,
            fps: fps.max(1),
            interlaced: false,
            format: PlanarFormat::Nv12,
            index: 0,
        }
    }

    pub fn interlaced(mut self, interlaced: bool) -> Self {
        self.interlaced = interlaced;
        self
    }

    pub fn format(mut self, format: PlanarFormat) -> Self {
        self.format = format;
        self
    }

    pub fn time_base(&self) -> Rational {
        TIME_BASE
    }

    fn luma(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar = (w / 16).max(1);
        let pos = (self.index as usize * 8) % w.max(1);
        let mut y = vec![0x60u8; w * h];
        for row in y.chunks_exact_mut(w.max(1)) {
            let end = (pos + bar).min(w);
            row[pos..end].fill(0xeb);
        }
        y
    }

    /// Produce the next frame.
    pub fn next_frame(&mut self) -> Frame {
        let (w, h) = (self.width, self.height);
        let chroma = (w as usize / 2) * (h as usize / 2);
        let pts = self.index as i64 * TIME_BASE.den as i64 / self.fps as i64;
        let luma = Bytes::from(self.luma());

        let mut frame = match self.format {
            PlanarFormat::Nv12 => Frame::nv12(w, h, luma, Bytes::from(vec![0x80; chroma * 2])),
            PlanarFormat::Yuv420p => Frame::yuv420p(
                w,
                h,
                luma,
                Bytes::from(vec![0x80; chroma]),
                Bytes::from(vec![0x80; chroma]),
            ),
        };
        frame.interlaced = self.interlaced;
        self.index += 1;
        frame.with_pts(pts)
    }
}

impl Iterator for TestPattern {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        Some(self.next_frame())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PixelFormat;

    #[test]
    fn frames_advance_in_time() {
        let mut pattern = TestPattern::new(64, 32, 25);
        let a = pattern.next_frame();
        let b = pattern.next_frame();
        assert_eq!(a.pts_ms(TIME_BASE), Some(0));
        assert_eq!(b.pts_ms(TIME_BASE), Some(40));
        assert_eq!(a.format(), PixelFormat::Nv12);
        assert_ne!(
            a.planar_image().unwrap().planes[0].data,
            b.planar_image().unwrap().planes[0].data
        );
    }

    #[test]
    fn yuv420p_planes_are_sized() {
        let frame = TestPattern::new(64, 32, 50)
            .format(PlanarFormat::Yuv420p)
            .interlaced(true)
            .next_frame();
        let image = frame.planar_image().unwrap();
        assert_eq!(image.planes.len(), 3);
        assert_eq!(image.planes[1].data.len(), 32 * 16);
        assert!(frame.interlaced);
    }
}
