//! Deinterlace and format conversion stage.
//!
//! A [`FilterGraph`] follows the push/pull model of a codec: frames are sent
//! in, outputs are received until it reports [`FilterOutput::Again`]. Sending
//! `None` flushes; once everything is drained it reports
//! [`FilterOutput::Eof`].

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use crate::error::{BufferError, FilterError};
use crate::video::{Frame, FrameData, PixelFormat, PlanarFormat, PlanarImage, Plane};
use crate::FilterConfig;

#[derive(Debug)]
pub enum FilterOutput {
    Frame(Frame),
    /// Needs more input.
    Again,
    /// Flushed and drained.
    Eof,
}

pub trait FilterGraph: Send {
    /// Feed a frame, or `None` to flush.
    fn send(&mut self, frame: Option<Frame>) -> Result<(), FilterError>;
    fn receive(&mut self) -> Result<FilterOutput, FilterError>;
    fn name(&self) -> &'static str;
}

/// Builds a graph for a stream given its first frame.
pub trait FilterFactory: Send + Sync {
    /// Fails with [`FilterError::NoHardwareDeinterlacer`] when the stream
    /// needs a deinterlacer for hardware surfaces that the platform lacks.
    fn build(&self, first: &Frame) -> Result<Box<dyn FilterGraph>, FilterError>;
}

/// CPU filters: bob deinterlacing and YUV420P to NV12 conversion.
/// Hardware surfaces cannot be deinterlaced here.
#[derive(Debug, Clone, Default)]
pub struct SoftwareFilters {
    config: FilterConfig,
}

impl SoftwareFilters {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }
}

impl FilterFactory for SoftwareFilters {
    fn build(&self, first: &Frame) -> Result<Box<dyn FilterGraph>, FilterError> {
        let deinterlace = first.interlaced && self.config.deinterlace;
        match first.format() {
            PixelFormat::DrmPrime if deinterlace => Err(FilterError::NoHardwareDeinterlacer),
            PixelFormat::Yuv420p | PixelFormat::Nv12 if deinterlace => {
                debug!("filter: bob deinterlacer for {}x{}", first.width, first.height);
                Ok(Box::new(BobDeinterlacer::new()))
            }
            PixelFormat::Yuv420p => Ok(Box::new(Nv12Converter::default())),
            other => Err(FilterError::Unsupported(format!("{other:?}"))),
        }
    }
}

/// Copy the picture out as tightly packed NV12 planes.
fn to_nv12(frame: &Frame) -> Result<(Vec<u8>, Vec<u8>), FilterError> {
    let image = frame.planar_image().ok_or(BufferError::NotPlanar)?;
    let (w, h) = (frame.width as usize, frame.height as usize);
    let mut luma = vec![0u8; w * h];
    let mut chroma = vec![0u8; w * (h / 2)];
    image.write_nv12(w, h, &mut luma, &mut chroma)?;
    Ok((luma, chroma))
}

fn nv12_frame(src: &Frame, luma: Vec<u8>, chroma: Vec<u8>) -> Frame {
    let stride = src.width as usize;
    let mut out = src.with_data(FrameData::Planar(PlanarImage {
        format: PlanarFormat::Nv12,
        planes: vec![
            Plane {
                data: Bytes::from(luma),
                stride,
            },
            Plane {
                data: Bytes::from(chroma),
                stride,
            },
        ],
    }));
    out.interlaced = false;
    out
}

/// Line-double one field of a `rows`-line plane.
fn double_field(src: &[u8], width: usize, rows: usize, parity: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * rows];
    for row in 0..rows {
        let from = ((row & !1) + parity).min(rows - 1);
        out[row * width..(row + 1) * width].copy_from_slice(&src[from * width..(from + 1) * width]);
    }
    out
}

/// Field-rate deinterlacer: every input yields one picture per field.
///
/// The second field's timestamp lies halfway to the next frame, so output is
/// held back by one input frame.
#[derive(Debug, Default)]
pub struct BobDeinterlacer {
    pending: Option<Frame>,
    interval: i64,
    out: VecDeque<Frame>,
    flushed: bool,
}

impl BobDeinterlacer {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, frame: Frame) -> Result<(), FilterError> {
        let (luma, chroma) = to_nv12(&frame)?;
        let w = frame.width as usize;
        let (h, ch) = (frame.height as usize, frame.height as usize / 2);
        let order = if frame.top_field_first { [0, 1] } else { [1, 0] };

        for (i, parity) in order.into_iter().enumerate() {
            let (y, uv) = if h == 0 {
                (Vec::new(), Vec::new())
            } else {
                (
                    double_field(&luma, w, h, parity),
                    if ch == 0 { Vec::new() } else { double_field(&chroma, w, ch, parity) },
                )
            };
            let mut field = nv12_frame(&frame, y, uv);
            field.pts = frame.pts.map(|pts| pts + i as i64 * self.interval / 2);
            self.out.push_back(field);
        }
        Ok(())
    }
}

impl FilterGraph for BobDeinterlacer {
    fn send(&mut self, frame: Option<Frame>) -> Result<(), FilterError> {
        if self.flushed {
            return Err(FilterError::Flushed);
        }
        match frame {
            Some(frame) => {
                if let Some(prev) = self.pending.take() {
                    if let (Some(a), Some(b)) = (prev.pts, frame.pts) {
                        if b > a {
                            self.interval = b - a;
                        }
                    }
                    self.emit(prev)?;
                }
                self.pending = Some(frame);
            }
            None => {
                if let Some(prev) = self.pending.take() {
                    self.emit(prev)?;
                }
                self.flushed = true;
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<FilterOutput, FilterError> {
        Ok(match self.out.pop_front() {
            Some(frame) => FilterOutput::Frame(frame),
            None if self.flushed => FilterOutput::Eof,
            None => FilterOutput::Again,
        })
    }

    fn name(&self) -> &'static str {
        "bob"
    }
}

/// Pass-through that only repacks YUV420P as NV12.
#[derive(Debug, Default)]
pub struct Nv12Converter {
    out: VecDeque<Frame>,
    flushed: bool,
}

impl FilterGraph for Nv12Converter {
    fn send(&mut self, frame: Option<Frame>) -> Result<(), FilterError> {
        if self.flushed {
            return Err(FilterError::Flushed);
        }
        match frame {
            Some(frame) => {
                let (luma, chroma) = to_nv12(&frame)?;
                let mut out = nv12_frame(&frame, luma, chroma);
                out.interlaced = frame.interlaced;
                self.out.push_back(out);
            }
            None => self.flushed = true,
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<FilterOutput, FilterError> {
        Ok(match self.out.pop_front() {
            Some(frame) => FilterOutput::Frame(frame),
            None if self.flushed => FilterOutput::Eof,
            None => FilterOutput::Again,
        })
    }

    fn name(&self) -> &'static str {
        "nv12"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{PrimeDescriptor, PrimeObject};
    use crate::kms::Fourcc;

    fn interlaced(pts: i64) -> Frame {
        // rows alternate 1 (top field) and 2 (bottom field)
        let luma: Vec<u8> = (0..4).flat_map(|row| [1 + (row % 2) as u8; 4]).collect();
        let mut frame = Frame::nv12(4, 4, Bytes::from(luma), Bytes::from(vec![0x80; 8]));
        frame.interlaced = true;
        frame.with_pts(pts)
    }

    fn drain(graph: &mut dyn FilterGraph) -> (Vec<Frame>, bool) {
        let mut frames = Vec::new();
        loop {
            match graph.receive().unwrap() {
                FilterOutput::Frame(f) => frames.push(f),
                FilterOutput::Again => return (frames, false),
                FilterOutput::Eof => return (frames, true),
            }
        }
    }

    fn luma(frame: &Frame) -> Vec<u8> {
        frame.planar_image().unwrap().planes[0].data.to_vec()
    }

    #[test]
    fn bob_doubles_the_frame_rate() {
        let mut bob = BobDeinterlacer::new();
        bob.send(Some(interlaced(0))).unwrap();
        assert!(drain(&mut bob).0.is_empty());

        bob.send(Some(interlaced(40))).unwrap();
        let (out, eof) = drain(&mut bob);
        assert!(!eof);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].pts, Some(0));
        assert_eq!(out[1].pts, Some(20));
        assert!(!out[0].interlaced);
        assert_eq!(luma(&out[0]), vec![1; 16]);
        assert_eq!(luma(&out[1]), vec![2; 16]);

        bob.send(None).unwrap();
        let (out, eof) = drain(&mut bob);
        assert!(eof);
        assert_eq!(out.iter().map(|f| f.pts).collect::<Vec<_>>(), [Some(40), Some(60)]);
        assert!(matches!(bob.send(None), Err(FilterError::Flushed)));
    }

    #[test]
    fn bottom_field_first_swaps_order() {
        let mut bob = BobDeinterlacer::new();
        let mut frame = interlaced(0);
        frame.top_field_first = false;
        bob.send(Some(frame)).unwrap();
        bob.send(None).unwrap();
        let (out, _) = drain(&mut bob);
        assert_eq!(luma(&out[0]), vec![2; 16]);
    }

    #[test]
    fn converter_repacks_yuv420p() {
        let mut conv = Nv12Converter::default();
        let frame = Frame::yuv420p(
            2,
            2,
            Bytes::from(vec![9u8; 4]),
            Bytes::from(vec![3u8]),
            Bytes::from(vec![5u8]),
        )
        .with_pts(7);
        conv.send(Some(frame)).unwrap();
        let (out, _) = drain(&mut conv);
        let image = out[0].planar_image().unwrap();
        assert_eq!(image.format, PlanarFormat::Nv12);
        assert_eq!(image.planes[1].data.as_ref(), &[3, 5]);
        assert_eq!(out[0].pts, Some(7));
    }

    #[test]
    fn factory_routes_by_format() {
        let filters = SoftwareFilters::new(FilterConfig::default());
        let mut prime = Frame::prime(
            4,
            4,
            PrimeDescriptor {
                objects: vec![PrimeObject {
                    fd: 0,
                    size: 24,
                    modifier: 0,
                }],
                format: Fourcc::NV12,
                planes: Vec::new(),
                owner: None,
            },
        );
        prime.interlaced = true;
        assert!(matches!(
            filters.build(&prime),
            Err(FilterError::NoHardwareDeinterlacer)
        ));
        assert_eq!(filters.build(&interlaced(0)).unwrap().name(), "bob");

        let progressive = Frame::yuv420p(2, 2, Bytes::new(), Bytes::new(), Bytes::new());
        assert_eq!(filters.build(&progressive).unwrap().name(), "nv12");
    }
}
