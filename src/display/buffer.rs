//! Scan-out buffer allocation, import and pooling.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use drm_fourcc::DrmModifier;
use memmap2::MmapMut;
use tracing::{debug, error, info, instrument, warn};

use crate::error::BufferError;
use crate::kms::{Fourcc, FramebufferDesc, KmsDevice};
use crate::video::{Frame, FrameData, PrimeDescriptor, PrimeObject, PrimePlane};

/// A framebuffer registered with the display, backed either by a dumb
/// buffer we allocated or by an imported dma-buf.
pub struct ScanoutBuffer {
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub fb_id: u32,
    pub size: u64,
    map: Option<MmapMut>,
    dumb: bool,
    /// dma-buf exported from our own dumb buffer.
    export: Option<OwnedFd>,
    /// Pool key: the dma-buf fd this buffer was created for.
    prime_fd: Option<RawFd>,
}

impl std::fmt::Debug for ScanoutBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanoutBuffer")
            .field("fb_id", &self.fb_id)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("format", &self.format)
            .field("prime_fd", &self.prime_fd)
            .finish()
    }
}

impl ScanoutBuffer {
    /// Register a framebuffer for `width`x`height` pixels of `format`.
    ///
    /// With `import`, the dma-buf is turned into a local handle and wrapped
    /// as is, modifiers included. Framebuffer registration with modifiers is
    /// retried once without them. Without `import`, a dumb buffer is
    /// allocated and mapped for CPU writes.
    #[instrument(level = "debug", skip(card, import))]
    pub fn create(
        card: &dyn KmsDevice,
        width: u32,
        height: u32,
        format: Fourcc,
        import: Option<&PrimeDescriptor>,
    ) -> Result<Self, BufferError> {
        match import {
            Some(desc) => Self::import(card, width, height, desc),
            None => Self::allocate(card, width, height, format),
        }
    }

    fn import(
        card: &dyn KmsDevice,
        width: u32,
        height: u32,
        desc: &PrimeDescriptor,
    ) -> Result<Self, BufferError> {
        let object = desc.objects.first().ok_or(BufferError::EmptyDescriptor)?;
        let handle = card.prime_fd_to_handle(object.fd)?;

        let mut handles = [0u32; 4];
        let mut pitches = [0u32; 4];
        let mut offsets = [0u32; 4];
        let mut modifiers = [0u64; 4];
        for (i, plane) in desc.planes.iter().take(4).enumerate() {
            handles[i] = handle;
            pitches[i] = plane.pitch;
            offsets[i] = plane.offset;
            modifiers[i] = desc
                .objects
                .get(plane.object_index)
                .map_or(object.modifier, |o| o.modifier);
        }

        let mut fb = FramebufferDesc {
            width,
            height,
            format: desc.format,
            handles,
            pitches,
            offsets,
            modifiers: (DrmModifier::from(object.modifier) != DrmModifier::Linear).then_some(modifiers),
        };
        let fb_id = match card.add_framebuffer(&fb) {
            Ok(id) => id,
            Err(e) if fb.modifiers.is_some() => {
                warn!("ADDFB2 with modifier {:#x} failed ({}), retrying without", object.modifier, e);
                fb.modifiers = None;
                card.add_framebuffer(&fb)
                    .inspect_err(|_| close_handle(card, handle))?
            }
            Err(e) => {
                close_handle(card, handle);
                return Err(e.into());
            }
        };

        Ok(Self {
            width,
            height,
            format: desc.format,
            handles,
            pitches,
            offsets,
            fb_id,
            size: object.size as u64,
            map: None,
            dumb: false,
            export: None,
            prime_fd: Some(object.fd),
        })
    }

    fn allocate(
        card: &dyn KmsDevice,
        width: u32,
        height: u32,
        format: Fourcc,
    ) -> Result<Self, BufferError> {
        let creq = card.create_dumb(width, height, format.dumb_bpp())?;
        let h = creq.handle;
        let (handles, pitches, offsets) = if format == Fourcc::NV12 {
            ([h, h, 0, 0], [width, width, 0, 0], [0, width * height, 0, 0])
        } else if format == Fourcc::YUV420 {
            let chroma = width / 2;
            let u = width * height;
            (
                [h, h, h, 0],
                [width, chroma, chroma, 0],
                [0, u, u + chroma * height / 2, 0],
            )
        } else if format == Fourcc::ARGB8888 {
            ([h, 0, 0, 0], [creq.pitch, 0, 0, 0], [0; 4])
        } else {
            destroy_dumb(card, h);
            return Err(BufferError::UnsupportedFormat(format));
        };

        let fb = FramebufferDesc {
            width,
            height,
            format,
            handles,
            pitches,
            offsets,
            modifiers: None,
        };
        let fb_id = card
            .add_framebuffer(&fb)
            .inspect_err(|_| destroy_dumb(card, h))?;
        let map = match card.map_dumb(h, creq.size) {
            Ok(map) => map,
            Err(e) => {
                let _ = card.remove_framebuffer(fb_id);
                destroy_dumb(card, h);
                return Err(e.into());
            }
        };

        Ok(Self {
            width,
            height,
            format,
            handles,
            pitches,
            offsets,
            fb_id,
            size: creq.size,
            map: Some(map),
            dumb: true,
            export: None,
            prime_fd: None,
        })
    }

    /// Unmap, unregister and release the backing memory. A second call is a
    /// no-op: the identifying fields are cleared on the first.
    pub fn destroy(&mut self, card: &dyn KmsDevice) {
        if self.is_destroyed() {
            return;
        }
        self.map = None;
        if self.fb_id != 0 {
            if let Err(e) = card.remove_framebuffer(self.fb_id) {
                error!("cannot remove framebuffer {}: {}", self.fb_id, e);
            }
        }
        if self.dumb {
            destroy_dumb(card, self.handles[0]);
        } else if self.handles[0] != 0 {
            close_handle(card, self.handles[0]);
        }
        self.export = None;

        self.width = 0;
        self.height = 0;
        self.fb_id = 0;
        self.handles = [0; 4];
        self.size = 0;
        self.prime_fd = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.fb_id == 0 && self.handles[0] == 0
    }

    pub fn prime_fd(&self) -> Option<RawFd> {
        self.prime_fd
    }

    pub fn pixels_mut(&mut self) -> Option<&mut [u8]> {
        self.map.as_deref_mut()
    }

    /// Export a dumb buffer as a dma-buf and key it by the new fd.
    fn export(&mut self, card: &dyn KmsDevice) -> Result<RawFd, BufferError> {
        let fd = card.prime_handle_to_fd(self.handles[0])?;
        let raw = fd.as_raw_fd();
        self.export = Some(fd);
        self.prime_fd = Some(raw);
        Ok(raw)
    }

    /// Fill an NV12 buffer with video black.
    pub fn fill_black(&mut self) {
        let luma = (self.pitches[0] * self.height) as usize;
        let chroma = luma / 2;
        if let Some(pixels) = self.map.as_deref_mut() {
            let (y, uv) = pixels.split_at_mut(luma.min(pixels.len()));
            y.fill(0x10);
            let n = chroma.min(uv.len());
            uv[..n].fill(0x80);
        }
    }
}

fn destroy_dumb(card: &dyn KmsDevice, handle: u32) {
    if let Err(e) = card.destroy_dumb(handle) {
        error!("cannot destroy dumb buffer {}: {}", handle, e);
    }
}

fn close_handle(card: &dyn KmsDevice, handle: u32) {
    if let Err(e) = card.gem_close(handle) {
        error!("cannot close GEM handle {}: {}", handle, e);
    }
}

/// Pool of scan-out buffers keyed by dma-buf fd.
pub struct BufferManager {
    card: Arc<dyn KmsDevice>,
    pool: Vec<ScanoutBuffer>,
    index: HashMap<RawFd, usize>,
    limit: usize,
    upload_count: usize,
    /// Pool slots of the software upload set, in round-robin order.
    upload: Vec<usize>,
    upload_next: usize,
}

impl BufferManager {
    pub fn new(card: Arc<dyn KmsDevice>, limit: usize, upload_count: usize) -> Self {
        Self {
            card,
            pool: Vec::new(),
            index: HashMap::new(),
            limit,
            upload_count,
            upload: Vec::new(),
            upload_next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Buffer for the surface behind `sharing_fd`, importing it on first use.
    /// A surface seen again with other dimensions is imported anew in place.
    pub fn find_or_create(
        &mut self,
        desc: &PrimeDescriptor,
        width: u32,
        height: u32,
    ) -> Result<&ScanoutBuffer, BufferError> {
        let fd = desc.objects.first().ok_or(BufferError::EmptyDescriptor)?.fd;

        if let Some(&slot) = self.index.get(&fd) {
            let (w, h) = (self.pool[slot].width, self.pool[slot].height);
            if (w, h) == (width, height) {
                return Ok(&self.pool[slot]);
            }
            debug!("fd {} changed from {}x{} to {}x{}, re-importing", fd, w, h, width, height);
            let card = self.card.as_ref();
            self.pool[slot].destroy(card);
            self.pool[slot] = ScanoutBuffer::create(card, width, height, desc.format, Some(desc))?;
            return Ok(&self.pool[slot]);
        }

        if self.pool.len() >= self.limit {
            return Err(BufferError::PoolExhausted(self.limit));
        }
        let buf = ScanoutBuffer::create(self.card.as_ref(), width, height, desc.format, Some(desc))?;
        debug!("imported fd {} as fb {} ({}x{} {:?})", fd, buf.fb_id, width, height, desc.format);
        self.index.insert(fd, self.pool.len());
        self.pool.push(buf);
        Ok(&self.pool[self.pool.len() - 1])
    }

    /// Copy a software frame into the next buffer of the upload set and return
    /// a hardware-surface frame referencing it.
    pub fn upload(&mut self, frame: &Frame) -> Result<Frame, BufferError> {
        let image = frame.planar_image().ok_or(BufferError::NotPlanar)?;
        self.ensure_upload_set(frame.width, frame.height)?;

        let slot = self.upload[self.upload_next];
        self.upload_next = (self.upload_next + 1) % self.upload.len();

        let (w, h) = (frame.width as usize, frame.height as usize);
        let buf = &mut self.pool[slot];
        let fd = buf.prime_fd.ok_or(BufferError::NotPrime)?;
        let size = buf.size as usize;
        let pixels = buf.pixels_mut().ok_or(BufferError::Geometry {
            width: frame.width,
            height: frame.height,
        })?;
        let (luma, chroma) = pixels.split_at_mut((w * h).min(pixels.len()));
        image.write_nv12(w, h, luma, chroma)?;

        let pitch = frame.width;
        Ok(frame.with_data(FrameData::Prime(PrimeDescriptor {
            objects: vec![PrimeObject {
                fd,
                size,
                modifier: 0,
            }],
            format: Fourcc::NV12,
            planes: vec![
                PrimePlane {
                    object_index: 0,
                    offset: 0,
                    pitch,
                },
                PrimePlane {
                    object_index: 0,
                    offset: pitch * frame.height,
                    pitch,
                },
            ],
            owner: None,
        })))
    }

    fn ensure_upload_set(&mut self, width: u32, height: u32) -> Result<(), BufferError> {
        if let Some(&first) = self.upload.first() {
            let buf = &self.pool[first];
            if buf.width == width && buf.height == height {
                return Ok(());
            }
            info!("upload size changed to {}x{}, allocating a new set", width, height);
        }
        if self.pool.len() + self.upload_count > self.limit {
            return Err(BufferError::PoolExhausted(self.limit));
        }

        let mut slots = Vec::with_capacity(self.upload_count);
        for _ in 0..self.upload_count {
            let card = self.card.as_ref();
            let mut buf = ScanoutBuffer::create(card, width, height, Fourcc::NV12, None)?;
            let fd = match buf.export(card) {
                Ok(fd) => fd,
                Err(e) => {
                    buf.destroy(card);
                    return Err(e);
                }
            };
            self.index.insert(fd, self.pool.len());
            slots.push(self.pool.len());
            self.pool.push(buf);
        }
        debug!("allocated {} upload buffers {}x{}", slots.len(), width, height);
        self.upload = slots;
        self.upload_next = 0;
        Ok(())
    }

    /// Destroy every pooled buffer. Returns how many there were.
    pub fn destroy_all(&mut self) -> usize {
        let count = self.pool.len();
        for buf in &mut self.pool {
            buf.destroy(self.card.as_ref());
        }
        self.pool.clear();
        self.index.clear();
        self.upload.clear();
        self.upload_next = 0;
        count
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::VirtualCard;
    use bytes::Bytes;
    use std::fs::File;

    fn prime(fd: RawFd, width: u32, height: u32) -> PrimeDescriptor {
        PrimeDescriptor {
            objects: vec![PrimeObject {
                fd,
                size: (width * height * 3 / 2) as usize,
                modifier: 0,
            }],
            format: Fourcc::NV12,
            planes: vec![
                PrimePlane {
                    object_index: 0,
                    offset: 0,
                    pitch: width,
                },
                PrimePlane {
                    object_index: 0,
                    offset: width * height,
                    pitch: width,
                },
            ],
            owner: None,
        }
    }

    #[test]
    fn nv12_dumb_layout() {
        let card = VirtualCard::new();
        let mut buf = ScanoutBuffer::create(&card, 720, 576, Fourcc::NV12, None).unwrap();
        assert_eq!(buf.pitches[..2], [720, 720]);
        assert_eq!(buf.offsets[1], 720 * 576);
        buf.fill_black();
        let pixels = buf.pixels_mut().unwrap();
        assert_eq!(pixels[0], 0x10);
        assert_eq!(pixels[720 * 576], 0x80);
    }

    #[test]
    fn destroy_twice_is_a_noop() {
        let card = VirtualCard::new();
        let mut buf = ScanoutBuffer::create(&card, 64, 64, Fourcc::ARGB8888, None).unwrap();
        assert_eq!(card.framebuffer_count(), 1);
        buf.destroy(&card);
        assert!(buf.is_destroyed());
        assert_eq!((buf.fb_id, buf.width, buf.height), (0, 0, 0));
        buf.destroy(&card);
        assert_eq!(card.framebuffer_count(), 0);
        assert_eq!(card.dumb_count(), 0);
    }

    #[test]
    fn modifier_failure_retries_plain() {
        let card = VirtualCard::with_options(crate::kms::virt::VirtualOptions {
            reject_modifiers: true,
            ..Default::default()
        });
        let file = File::open("/dev/null").unwrap();
        let mut desc = prime(file.as_raw_fd(), 64, 64);
        desc.objects[0].modifier = 0x0700_0000_0000_0004;
        let buf = ScanoutBuffer::create(&card, 64, 64, Fourcc::NV12, Some(&desc)).unwrap();
        assert!(card.framebuffer(buf.fb_id).unwrap().modifiers.is_none());
    }

    #[test]
    fn same_fd_reuses_the_buffer() {
        let card = Arc::new(VirtualCard::new());
        let mut pool = BufferManager::new(card.clone(), 4, 2);
        let file = File::open("/dev/null").unwrap();
        let desc = prime(file.as_raw_fd(), 320, 240);

        let first = pool.find_or_create(&desc, 320, 240).unwrap() as *const ScanoutBuffer;
        let second = pool.find_or_create(&desc, 320, 240).unwrap() as *const ScanoutBuffer;
        assert!(std::ptr::eq(first, second));
        assert_eq!(pool.len(), 1);
        assert_eq!(card.framebuffer_count(), 1);
    }

    #[test]
    fn pool_limit_is_enforced() {
        let card = Arc::new(VirtualCard::new());
        let mut pool = BufferManager::new(card, 1, 2);
        let a = File::open("/dev/null").unwrap();
        let b = File::open("/dev/null").unwrap();
        pool.find_or_create(&prime(a.as_raw_fd(), 32, 32), 32, 32).unwrap();
        assert!(matches!(
            pool.find_or_create(&prime(b.as_raw_fd(), 32, 32), 32, 32),
            Err(BufferError::PoolExhausted(1))
        ));
    }

    #[test]
    fn upload_round_robins_and_is_found_by_fd() {
        let card = Arc::new(VirtualCard::new());
        let mut pool = BufferManager::new(card.clone(), 8, 3);
        let frame = Frame::nv12(16, 8, Bytes::from(vec![0x42; 128]), Bytes::from(vec![0x80; 64]));

        let fds: Vec<RawFd> = (0..4)
            .map(|_| pool.upload(&frame).unwrap().sharing_fd().unwrap())
            .collect();
        assert_eq!(pool.len(), 3);
        assert_ne!(fds[0], fds[1]);
        assert_eq!(fds[0], fds[3]);

        let uploaded = pool.upload(&frame).unwrap();
        let desc = uploaded.prime_descriptor().unwrap().clone();
        pool.find_or_create(&desc, 16, 8).unwrap();
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.destroy_all(), 3);
        assert!(pool.is_empty());
        assert_eq!(card.dumb_count(), 0);
    }
}
