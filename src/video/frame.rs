use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BufferError;
use crate::kms::Fourcc;

/// Pixel formats offered by the decoder during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Hardware surface exported as a dma-buf.
    DrmPrime,
    Yuv420p,
    Nv12,
    Yuyv422,
    Rgb24,
}

/// A rational number, used for time bases and sample aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// `0.0` for an unset ratio.
    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self { num: 0, den: 1 }
    }
}

/// CPU plane layouts a software frame may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarFormat {
    Yuv420p,
    Nv12,
}

#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub stride: usize,
}

/// Decoded picture in process memory.
#[derive(Debug, Clone)]
pub struct PlanarImage {
    pub format: PlanarFormat,
    pub planes: Vec<Plane>,
}

impl PlanarImage {
    /// Write the image as NV12 into a luma plane and an interleaved chroma
    /// plane, both with a pitch of `width`.
    pub fn write_nv12(
        &self,
        width: usize,
        height: usize,
        luma: &mut [u8],
        chroma: &mut [u8],
    ) -> Result<(), BufferError> {
        let geometry = || BufferError::Geometry {
            width: width as u32,
            height: height as u32,
        };
        let chroma_rows = height / 2;
        if luma.len() < width * height || chroma.len() < width * chroma_rows {
            return Err(geometry());
        }

        let y = self.planes.first().ok_or_else(geometry)?;
        for row in 0..height {
            let src = y
                .data
                .get(row * y.stride..row * y.stride + width)
                .ok_or_else(geometry)?;
            luma[row * width..(row + 1) * width].copy_from_slice(src);
        }

        match self.format {
            PlanarFormat::Nv12 => {
                let uv = self.planes.get(1).ok_or_else(geometry)?;
                for row in 0..chroma_rows {
                    let src = uv
                        .data
                        .get(row * uv.stride..row * uv.stride + width)
                        .ok_or_else(geometry)?;
                    chroma[row * width..(row + 1) * width].copy_from_slice(src);
                }
            }
            PlanarFormat::Yuv420p => {
                let (u, v) = match (self.planes.get(1), self.planes.get(2)) {
                    (Some(u), Some(v)) => (u, v),
                    _ => return Err(geometry()),
                };
                let half = width / 2;
                for row in 0..chroma_rows {
                    let us = u
                        .data
                        .get(row * u.stride..row * u.stride + half)
                        .ok_or_else(geometry)?;
                    let vs = v
                        .data
                        .get(row * v.stride..row * v.stride + half)
                        .ok_or_else(geometry)?;
                    let dst = &mut chroma[row * width..row * width + half * 2];
                    for (i, pair) in dst.chunks_exact_mut(2).enumerate() {
                        pair[0] = us[i];
                        pair[1] = vs[i];
                    }
                }
            }
        }
        Ok(())
    }
}

/// One dma-buf backing a hardware surface.
#[derive(Debug, Clone, Copy)]
pub struct PrimeObject {
    pub fd: RawFd,
    pub size: usize,
    pub modifier: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PrimePlane {
    pub object_index: usize,
    pub offset: u32,
    pub pitch: u32,
}

/// Layout of a hardware surface, as exported by the decoder.
#[derive(Clone)]
pub struct PrimeDescriptor {
    pub objects: Vec<PrimeObject>,
    pub format: Fourcc,
    pub planes: Vec<PrimePlane>,
    /// Keeps the upstream surface alive while the frame is queued or shown.
    pub owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for PrimeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimeDescriptor")
            .field("objects", &self.objects)
            .field("format", &self.format)
            .field("planes", &self.planes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum FrameData {
    Planar(PlanarImage),
    Prime(PrimeDescriptor),
}

/// A decoded picture moving through the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Presentation time in stream time base units.
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub sample_aspect: Rational,
    pub interlaced: bool,
    pub top_field_first: bool,
    /// Decoder reported errors while producing this picture.
    pub corrupt: bool,
    pub data: FrameData,
}

impl Frame {
    pub fn planar(width: u32, height: u32, image: PlanarImage) -> Self {
        Self {
            pts: None,
            width,
            height,
            sample_aspect: Rational::new(1, 1),
            interlaced: false,
            top_field_first: true,
            corrupt: false,
            data: FrameData::Planar(image),
        }
    }

    pub fn prime(width: u32, height: u32, desc: PrimeDescriptor) -> Self {
        Self {
            data: FrameData::Prime(desc),
            ..Self::planar(
                width,
                height,
                PlanarImage {
                    format: PlanarFormat::Nv12,
                    planes: Vec::new(),
                },
            )
        }
    }

    /// Tightly packed NV12 frame.
    pub fn nv12(width: u32, height: u32, luma: Bytes, chroma: Bytes) -> Self {
        let stride = width as usize;
        Self::planar(
            width,
            height,
            PlanarImage {
                format: PlanarFormat::Nv12,
                planes: vec![
                    Plane { data: luma, stride },
                    Plane {
                        data: chroma,
                        stride,
                    },
                ],
            },
        )
    }

    /// Tightly packed YUV420P frame.
    pub fn yuv420p(width: u32, height: u32, y: Bytes, u: Bytes, v: Bytes) -> Self {
        let stride = width as usize;
        Self::planar(
            width,
            height,
            PlanarImage {
                format: PlanarFormat::Yuv420p,
                planes: vec![
                    Plane { data: y, stride },
                    Plane {
                        data: u,
                        stride: stride / 2,
                    },
                    Plane {
                        data: v,
                        stride: stride / 2,
                    },
                ],
            },
        )
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn format(&self) -> PixelFormat {
        match &self.data {
            FrameData::Prime(_) => PixelFormat::DrmPrime,
            FrameData::Planar(p) => match p.format {
                PlanarFormat::Yuv420p => PixelFormat::Yuv420p,
                PlanarFormat::Nv12 => PixelFormat::Nv12,
            },
        }
    }

    pub fn prime_descriptor(&self) -> Option<&PrimeDescriptor> {
        match &self.data {
            FrameData::Prime(desc) => Some(desc),
            FrameData::Planar(_) => None,
        }
    }

    pub fn planar_image(&self) -> Option<&PlanarImage> {
        match &self.data {
            FrameData::Planar(image) => Some(image),
            FrameData::Prime(_) => None,
        }
    }

    /// The dma-buf fd identifying this frame's surface.
    pub fn sharing_fd(&self) -> Option<RawFd> {
        self.prime_descriptor()?.objects.first().map(|o| o.fd)
    }

    /// Presentation time in milliseconds.
    pub fn pts_ms(&self, time_base: Rational) -> Option<i64> {
        if time_base.den == 0 {
            return None;
        }
        self.pts.map(|pts| {
            (pts as i128 * 1000 * time_base.num as i128 / time_base.den as i128) as i64
        })
    }

    /// Copy of the metadata around new pixel data.
    pub fn with_data(&self, data: FrameData) -> Frame {
        Frame {
            pts: self.pts,
            width: self.width,
            height: self.height,
            sample_aspect: self.sample_aspect,
            interlaced: self.interlaced,
            top_field_first: self.top_field_first,
            corrupt: self.corrupt,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420p_interleaves_into_nv12() {
        let frame = Frame::yuv420p(
            4,
            2,
            Bytes::from(vec![1u8; 8]),
            Bytes::from(vec![2u8, 3]),
            Bytes::from(vec![7u8, 9]),
        );
        let mut luma = [0u8; 8];
        let mut chroma = [0u8; 4];
        frame
            .planar_image()
            .unwrap()
            .write_nv12(4, 2, &mut luma, &mut chroma)
            .unwrap();
        assert_eq!(luma, [1; 8]);
        assert_eq!(chroma, [2, 7, 3, 9]);
    }

    #[test]
    fn short_plane_is_a_geometry_error() {
        let frame = Frame::nv12(4, 4, Bytes::from(vec![0u8; 8]), Bytes::from(vec![0u8; 8]));
        let mut luma = [0u8; 16];
        let mut chroma = [0u8; 8];
        let err = frame
            .planar_image()
            .unwrap()
            .write_nv12(4, 4, &mut luma, &mut chroma)
            .unwrap_err();
        assert!(matches!(err, BufferError::Geometry { .. }));
    }

    #[test]
    fn pts_scales_by_time_base() {
        let frame = Frame::nv12(2, 2, Bytes::new(), Bytes::new()).with_pts(90_000);
        assert_eq!(frame.pts_ms(Rational::new(1, 90_000)), Some(1000));
        assert_eq!(frame.format(), PixelFormat::Nv12);
    }
}
