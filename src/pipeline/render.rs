//! The render context: entry points called by the player, plus the display
//! and filter threads behind them.
//!
//! ```text
//! render_frame ──► pre-filter ring ──► filter thread ──┐
//!      │                                              ▼
//!      └──────── (prime / uploaded) ──────────► post-filter ring ──► display thread ──► atomic commit
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::filter::{FilterFactory, FilterGraph, FilterOutput, SoftwareFilters};
use super::ringbuf::FrameRing;
use super::sync::{decide, trick_delay, SyncDecision};
use crate::clock::AudioClock;
use crate::display::commit::modeset;
use crate::display::{
    BufferManager, Committer, OsdSurface, PictureShape, ScanoutBuffer, VideoTarget, ZposState,
};
use crate::error::{FilterError, RenderError};
use crate::kms::{CrtcInfo, DisplayLayout, Fourcc, KmsDevice};
use crate::utils::PLATFORM;
use crate::video::{negotiate_format, Frame, PixelFormat, Rational};
use crate::{metric, Config, FilterConfig, PipelineConfig, ScreenSize, Stats, SyncConfig};

const NO_PTS: i64 = i64::MIN;

/// State shared between the API and the worker threads.
struct Shared {
    card: Arc<dyn KmsDevice>,
    layout: DisplayLayout,
    pipeline: PipelineConfig,
    filter: FilterConfig,
    sync: ArcSwap<SyncConfig>,
    audio: Arc<dyn AudioClock>,
    factory: Arc<dyn FilterFactory>,

    pre: FrameRing<Frame>,
    post: FrameRing<Frame>,
    buffers: Mutex<BufferManager>,
    osd: Mutex<OsdSurface>,
    black: Mutex<ScanoutBuffer>,
    black_target: VideoTarget,

    paused: AtomicBool,
    closing: AtomicBool,
    filter_close: AtomicBool,
    filter_active: AtomicBool,
    shutdown: AtomicBool,
    no_hw_deint: AtomicBool,
    trick_speed: AtomicU32,

    start_count: AtomicU64,
    duplicated: AtomicU64,
    dropped: AtomicU64,
    pts: AtomicI64,
    /// Bumped under the buffer lock each time a close has cleaned up.
    stream_gen: AtomicU64,
    time_base: Mutex<Rational>,
    last_displayed: AtomicU32,
    osd_on_top: AtomicBool,

    pause_lock: Mutex<()>,
    pause_cv: Condvar,
    drained: Mutex<bool>,
    drained_cv: Condvar,
}

/// Video output for one display.
///
/// All methods take `&self`; the context is meant to be shared between the
/// decoder thread feeding frames and the player thread driving playback.
pub struct RenderContext {
    shared: Arc<Shared>,
    saved_crtc: Option<CrtcInfo>,
    display_thread: Mutex<Option<JoinHandle<()>>>,
    filter_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RenderContext {
    pub fn new(
        card: Arc<dyn KmsDevice>,
        layout: DisplayLayout,
        config: &Config,
        audio: Arc<dyn AudioClock>,
    ) -> Result<Self, RenderError> {
        let factory = Arc::new(SoftwareFilters::new(config.filter.clone()));
        Self::with_filters(card, layout, config, audio, factory)
    }

    /// Like [`RenderContext::new`] with a custom filter stage.
    pub fn with_filters(
        card: Arc<dyn KmsDevice>,
        layout: DisplayLayout,
        config: &Config,
        audio: Arc<dyn AudioClock>,
        factory: Arc<dyn FilterFactory>,
    ) -> Result<Self, RenderError> {
        let mode = layout.mode;
        let osd_buf = ScanoutBuffer::create(
            card.as_ref(),
            mode.hdisplay as u32,
            mode.vdisplay as u32,
            Fourcc::ARGB8888,
            None,
        )?;
        let mut black = ScanoutBuffer::create(
            card.as_ref(),
            config.device.black_width,
            config.device.black_height,
            Fourcc::NV12,
            None,
        )?;
        black.fill_black();

        let saved_crtc = match card.crtc(layout.crtc.id) {
            Ok(crtc) => Some(crtc),
            Err(e) => {
                warn!("cannot save CRTC {}: {}", layout.crtc.id, e);
                None
            }
        };
        if let Err(e) = modeset(card.as_ref(), &layout, &osd_buf, &black) {
            let mut osd_buf = osd_buf;
            osd_buf.destroy(card.as_ref());
            black.destroy(card.as_ref());
            return Err(e.into());
        }

        let hw_deint = config
            .filter
            .hw_deinterlace
            .unwrap_or(PLATFORM.hw_deinterlace);
        let pipeline = config.pipeline.clone();
        let buffers = BufferManager::new(
            card.clone(),
            pipeline.pool_limit,
            pipeline.ring_capacity + 2,
        );
        info!(
            "render context ready: {:?} video plane {} osd plane {} zpos {}",
            mode, layout.video.id, layout.osd.id, layout.use_zpos
        );

        let shared = Shared {
            card,
            pipeline: pipeline.clone(),
            filter: config.filter.clone(),
            sync: ArcSwap::from_pointee(config.sync.clone()),
            audio,
            factory,
            pre: FrameRing::new(pipeline.ring_capacity),
            post: FrameRing::new(pipeline.ring_capacity),
            buffers: Mutex::new(buffers),
            osd: Mutex::new(OsdSurface::new(osd_buf)),
            black_target: VideoTarget::of(&black),
            last_displayed: AtomicU32::new(black.fb_id),
            black: Mutex::new(black),
            layout,
            paused: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            filter_close: AtomicBool::new(false),
            filter_active: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            no_hw_deint: AtomicBool::new(!hw_deint),
            trick_speed: AtomicU32::new(0),
            start_count: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            pts: AtomicI64::new(NO_PTS),
            stream_gen: AtomicU64::new(0),
            time_base: Mutex::new(Rational::default()),
            osd_on_top: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
            drained: Mutex::new(false),
            drained_cv: Condvar::new(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            saved_crtc,
            display_thread: Mutex::new(None),
            filter_thread: Mutex::new(None),
        })
    }

    /// Hand a decoded frame to the pipeline.
    ///
    /// Blocks while the next ring is full. Frames arriving while a close is
    /// in progress are dropped.
    pub fn render_frame(&self, time_base: Rational, frame: Frame) -> Result<(), RenderError> {
        let shared = &self.shared;
        if shared.start_count.load(Ordering::Acquire) == 0 {
            *shared.time_base.lock() = time_base;
        }
        if frame.corrupt {
            warn!("decoder flagged frame corrupt (pts {:?})", frame.pts);
        }
        if shared.closing.load(Ordering::Acquire) {
            trace!("closing, dropping frame pts {:?}", frame.pts);
            return Ok(());
        }
        let stream_gen = shared.stream_gen.load(Ordering::Acquire);
        self.ensure_display_thread()?;

        let deinterlace = frame.interlaced && shared.filter.deinterlace;
        let needs_filter = match frame.format() {
            PixelFormat::Yuv420p => true,
            PixelFormat::DrmPrime => deinterlace && !shared.no_hw_deint.load(Ordering::Acquire),
            PixelFormat::Nv12 => deinterlace && shared.filter.software_deinterlacer,
            _ => false,
        };

        if needs_filter {
            if self.ensure_filter_thread(&frame)? {
                shared.enqueue(&shared.pre, frame);
            }
        } else if frame.prime_descriptor().is_some() {
            shared.enqueue(&shared.post, frame);
        } else {
            shared.upload_and_queue(&frame, stream_gen, false);
        }
        Ok(())
    }

    fn ensure_display_thread(&self) -> Result<(), RenderError> {
        let mut slot = self.display_thread.lock();
        if slot.is_some() || self.shared.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("kmsvideo-display".into())
            .spawn(move || shared.display_loop())
            .map_err(|source| RenderError::Spawn {
                name: "display",
                source,
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Returns `false` when the frame cannot be filtered and is dropped.
    fn ensure_filter_thread(&self, first: &Frame) -> Result<bool, RenderError> {
        let shared = &self.shared;
        let mut slot = self.filter_thread.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return Ok(true);
            }
            join(slot.take(), "filter");
        }

        let graph = match shared.factory.build(first) {
            Ok(graph) => graph,
            Err(FilterError::NoHardwareDeinterlacer) => {
                if !shared.no_hw_deint.swap(true, Ordering::AcqRel) {
                    info!("no hardware deinterlacer, interlaced surfaces bypass the filter");
                }
                return Ok(false);
            }
            Err(e) => {
                error!("cannot build filter graph: {}", e);
                return Ok(false);
            }
        };
        info!("filter graph '{}' for {}x{} {:?}", graph.name(), first.width, first.height, first.format());

        shared.filter_active.store(true, Ordering::Release);
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("kmsvideo-filter".into())
            .spawn(move || worker.filter_loop(graph))
            .map_err(|source| {
                shared.filter_active.store(false, Ordering::Release);
                RenderError::Spawn {
                    name: "filter",
                    source,
                }
            })?;
        *slot = Some(handle);
        Ok(true)
    }

    /// Choose the decoder output format.
    pub fn get_format<F>(&self, candidates: &[PixelFormat], fallback: F) -> PixelFormat
    where
        F: FnOnce(&[PixelFormat]) -> PixelFormat,
    {
        negotiate_format(candidates, fallback)
    }

    /// Decoder name for `codec` on this platform.
    pub fn decoder_name<'a>(&self, codec: &'a str) -> std::borrow::Cow<'a, str> {
        PLATFORM.decoder_name(codec)
    }

    /// Stop the current stream: show black, release every scan-out buffer
    /// and reset the statistics. Returns once the display side is drained.
    pub fn set_closing(&self) {
        let shared = &self.shared;
        let has_buffers = !shared.buffers.lock().is_empty();

        if has_buffers {
            *shared.drained.lock() = false;
            shared.closing.store(true, Ordering::Release);
            shared.start_video();

            let mut done = shared.drained.lock();
            while !*done {
                if shared.shutdown.load(Ordering::Acquire) || !self.display_alive() {
                    warn!("display thread gone, not waiting for drain");
                    shared.closing.store(false, Ordering::Release);
                    break;
                }
                shared
                    .drained_cv
                    .wait_for(&mut done, Duration::from_millis(100));
            }
        } else {
            let n = shared.post.drain();
            if shared.filter_active.load(Ordering::Acquire) {
                shared.filter_close.store(true, Ordering::Release);
            }
            debug!("close without scan-out buffers, {} queued frames dropped", n);
        }

        {
            let mut slot = self.filter_thread.lock();
            let stopping = shared.filter_close.load(Ordering::Acquire);
            if slot.as_ref().is_some_and(|h| stopping || h.is_finished()) {
                join(slot.take(), "filter");
            }
        }

        shared.start_count.store(0, Ordering::Release);
        shared.duplicated.store(0, Ordering::Release);
        shared.dropped.store(0, Ordering::Release);
        shared.trick_speed.store(0, Ordering::Release);
        shared.pts.store(NO_PTS, Ordering::Release);
        info!("stream closed");
    }

    fn display_alive(&self) -> bool {
        self.display_thread
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn osd_clear(&self) {
        self.shared.osd.lock().clear();
    }

    /// Copy an ARGB rectangle onto the OSD. See [`OsdSurface::draw_argb`].
    #[allow(clippy::too_many_arguments)]
    pub fn osd_draw_argb(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pitch: usize,
        argb: &[u8],
        dst_x: u32,
        dst_y: u32,
    ) {
        self.shared
            .osd
            .lock()
            .draw_argb(x, y, width, height, pitch, argb, dst_x, dst_y);
    }

    /// 0 for normal playback; otherwise every frame is shown and held for
    /// `speed` trick steps.
    pub fn set_trick_speed(&self, speed: u32) {
        debug!("trick speed {}", speed);
        self.shared.trick_speed.store(speed, Ordering::Release);
        if self.shared.paused.load(Ordering::Acquire) {
            self.shared.start_video();
        }
    }

    pub fn pause(&self) {
        debug!("pause");
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn play(&self) {
        debug!("play");
        self.shared.trick_speed.store(0, Ordering::Release);
        self.shared.start_video();
    }

    /// Last pts handed to the display path, in stream time base units.
    pub fn get_clock(&self) -> Option<i64> {
        match self.shared.pts.load(Ordering::Acquire) {
            NO_PTS => None,
            pts => Some(pts),
        }
    }

    pub fn get_stats(&self) -> Stats {
        let shared = &self.shared;
        Stats {
            duplicated: shared.duplicated.load(Ordering::Acquire),
            dropped: shared.dropped.load(Ordering::Acquire),
            start_count: shared.start_count.load(Ordering::Acquire),
        }
    }

    pub fn get_screen_size(&self) -> ScreenSize {
        let mode = self.shared.layout.mode;
        ScreenSize {
            width: mode.hdisplay as u32,
            height: mode.vdisplay as u32,
            pixel_aspect: 16.0 / 9.0,
        }
    }

    pub fn set_audio_delay(&self, ms: i64) {
        self.shared.sync.rcu(|current| SyncConfig {
            audio_delay_ms: ms,
            ..SyncConfig::clone(current)
        });
        debug!("audio delay {} ms", ms);
    }

    /// Framebuffer id last put on the video plane.
    pub fn last_displayed(&self) -> u32 {
        self.shared.last_displayed.load(Ordering::Acquire)
    }

    pub fn black_fb(&self) -> u32 {
        self.shared.black_target.fb_id
    }

    pub fn pool_len(&self) -> usize {
        self.shared.buffers.lock().len()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn zpos_state(&self) -> ZposState {
        if self.shared.osd_on_top.load(Ordering::Acquire) {
            ZposState::OsdOnTop
        } else {
            ZposState::VideoOnTop
        }
    }

    /// Stop the worker threads, restore the saved CRTC and release every
    /// buffer. Called on drop; later calls do nothing.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.start_video();
        shared.drained_cv.notify_all();
        join(self.display_thread.lock().take(), "display");
        join(self.filter_thread.lock().take(), "filter");

        let card = shared.card.as_ref();
        if let Some(crtc) = &self.saved_crtc {
            if let Err(e) = card.set_crtc(crtc, &[shared.layout.connector.id]) {
                error!("cannot restore CRTC {}: {}", crtc.id, e);
            }
        }
        let buffers = shared.buffers.lock().destroy_all();
        shared.osd.lock().buffer.destroy(card);
        shared.black.lock().destroy(card);
        info!("render context shut down, {} buffers released", buffers);
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!("{} thread panicked", name);
        }
    }
}

/// What the display thread puts up next.
struct Picture {
    target: VideoTarget,
    shape: Option<PictureShape>,
    /// `None` for the black buffer.
    frame: Option<Frame>,
}

impl Shared {
    fn poll(&self) {
        thread::sleep(Duration::from_millis(self.pipeline.poll_interval_ms));
    }

    fn stopping(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }

    fn enqueue(&self, ring: &FrameRing<Frame>, mut frame: Frame) {
        loop {
            if self.stopping() {
                trace!("closing, dropping queued frame pts {:?}", frame.pts);
                return;
            }
            match ring.push(frame) {
                Ok(()) => return,
                Err(rejected) => frame = rejected,
            }
            self.poll();
        }
    }

    /// Copy a software frame into the upload set and queue it for display.
    ///
    /// Waits for room in the post-filter ring first, so the slot being
    /// overwritten is off screen. The stop check, the upload and the push
    /// all happen under the buffer lock; a close that cleans up in between
    /// bumps `stream_gen` and the frame is dropped.
    fn upload_and_queue(&self, frame: &Frame, stream_gen: u64, from_filter: bool) {
        loop {
            {
                let mut buffers = self.buffers.lock();
                if self.stopping()
                    || self.stream_gen.load(Ordering::Acquire) != stream_gen
                    || (from_filter && self.filter_close.load(Ordering::Acquire))
                {
                    trace!("closing, dropping frame pts {:?}", frame.pts);
                    return;
                }
                if !self.post.is_full() {
                    match buffers.upload(frame) {
                        Ok(uploaded) => {
                            if let Err(rejected) = self.post.push(uploaded) {
                                warn!("post-filter ring full, dropping frame pts {:?}", rejected.pts);
                            }
                        }
                        Err(e) => error!("cannot upload frame: {}", e),
                    }
                    return;
                }
            }
            self.poll();
        }
    }

    fn start_video(&self) {
        let _guard = self.pause_lock.lock();
        self.paused.store(false, Ordering::Release);
        self.start_count.store(0, Ordering::Release);
        self.pause_cv.notify_all();
    }

    fn wait_while_paused(&self) {
        let mut guard = self.pause_lock.lock();
        while self.paused.load(Ordering::Acquire) && !self.stopping() {
            self.pause_cv
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    /// Runs once per display thread; later streams start on their first
    /// frame.
    fn wait_start_gate(&self) {
        while self.post.len() < self.pipeline.start_threshold && !self.stopping() {
            self.poll();
        }
    }

    fn pin_display_core(&self) {
        let Some(core) = self.pipeline.display_core else {
            return;
        };
        let id = core_affinity::get_core_ids()
            .and_then(|ids| ids.into_iter().find(|c| c.id == core));
        match id {
            Some(id) if core_affinity::set_for_current(id) => {
                debug!("display thread pinned to core {}", core)
            }
            _ => warn!("cannot pin display thread to core {}", core),
        }
    }

    fn display_loop(self: Arc<Self>) {
        self.pin_display_core();
        info!("display thread started");

        let flip_timeout = Duration::from_millis(self.pipeline.flip_timeout_ms);
        let mut committer = Committer::new(self.card.clone(), self.layout.clone(), flip_timeout);
        let mut held: Option<Frame> = None;

        self.wait_start_gate();
        while !self.shutdown.load(Ordering::Acquire) {
            if self.paused.load(Ordering::Acquire) && !self.closing.load(Ordering::Acquire) {
                self.wait_while_paused();
                continue;
            }

            let Some(picture) = self.next_picture() else {
                break;
            };
            let request = {
                let mut osd = self.osd.lock();
                committer.build(picture.target, picture.shape, &mut osd)
            };
            if committer.submit(&request, picture.target.fb_id).is_ok() {
                committer.wait_for_flip();
                self.last_displayed
                    .store(picture.target.fb_id, Ordering::Release);
                self.osd_on_top.store(
                    committer.zpos_state() == ZposState::OsdOnTop,
                    Ordering::Release,
                );
                // the previous picture is off screen now
                held = picture.frame;
            } else {
                request.restore_osd(&mut self.osd.lock());
                self.poll();
            }

            if self.closing.load(Ordering::Acquire)
                && self.last_displayed.load(Ordering::Acquire) == self.black_target.fb_id
            {
                held = None;
                self.clean_after_close();
            }
        }
        drop(held);
        info!("display thread exit");
    }

    /// Pick the next picture, applying AV sync. `None` on shutdown.
    fn next_picture(&self) -> Option<Picture> {
        let black = Picture {
            target: self.black_target,
            shape: None,
            frame: None,
        };

        'dequeue: loop {
            if self.closing.load(Ordering::Acquire) {
                return Some(black);
            }
            let Some(frame) = self.post.pop() else {
                if self.shutdown.load(Ordering::Acquire) {
                    return None;
                }
                self.poll();
                continue;
            };

            let target = match frame.prime_descriptor() {
                Some(desc) => match self.buffers.lock().find_or_create(desc, frame.width, frame.height) {
                    Ok(buf) => VideoTarget::of(buf),
                    Err(e) => {
                        error!("cannot get scan-out buffer: {}", e);
                        continue;
                    }
                },
                None => {
                    error!("software frame reached the display thread");
                    continue;
                }
            };
            let shape = Some(PictureShape {
                width: frame.width,
                height: frame.height,
                sample_aspect: frame.sample_aspect,
            });

            if let Some(pts) = frame.pts {
                self.pts.store(pts, Ordering::Release);
            }
            let video_ms = frame.pts_ms(*self.time_base.lock());
            let trick = self.trick_speed.load(Ordering::Acquire);

            if self.start_count.load(Ordering::Acquire) == 0 && trick == 0 {
                if let Some(ms) = video_ms {
                    while !self.audio.video_ready(ms) {
                        if self.closing.load(Ordering::Acquire) {
                            return Some(black);
                        }
                        if self.shutdown.load(Ordering::Acquire) {
                            return None;
                        }
                        self.poll();
                    }
                }
            }

            loop {
                if self.closing.load(Ordering::Acquire) {
                    return Some(black);
                }
                if self.shutdown.load(Ordering::Acquire) {
                    return None;
                }
                let tuning = self.sync.load_full();
                let decision = match video_ms {
                    Some(video_ms) => decide(video_ms, self.audio.clock(), trick, &tuning),
                    None => SyncDecision::Display,
                };
                match decision {
                    SyncDecision::Display => break,
                    SyncDecision::Desync { diff } => {
                        warn!("audio/video desync of {} ms, displaying", diff);
                        break;
                    }
                    SyncDecision::AwaitAudio => {
                        thread::sleep(Duration::from_millis(tuning.audio_poll_ms));
                    }
                    SyncDecision::Drop { diff } => {
                        self.dropped.fetch_add(1, Ordering::AcqRel);
                        metrics::counter!(metric::FRAMES_DROPPED).increment(1);
                        debug!("drop frame, video {} ms behind", -diff);
                        let _ = self.start_count.compare_exchange(
                            0,
                            1,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        continue 'dequeue;
                    }
                    SyncDecision::Duplicate { diff } => {
                        self.duplicated.fetch_add(1, Ordering::AcqRel);
                        metrics::counter!(metric::FRAMES_DUPLICATED).increment(1);
                        trace!("hold picture, video {} ms ahead", diff);
                        thread::sleep(Duration::from_millis(tuning.duplicate_wait_ms));
                    }
                }
            }

            if trick == 0 {
                self.start_count.fetch_add(1, Ordering::AcqRel);
            } else {
                thread::sleep(trick_delay(trick, &self.sync.load_full()));
            }
            return Some(Picture {
                target,
                shape,
                frame: Some(frame),
            });
        }
    }

    /// Black is on screen after a close: release everything of the old
    /// stream and wake the closer.
    fn clean_after_close(&self) {
        let (queued, destroyed) = {
            let mut buffers = self.buffers.lock();
            if self.filter_active.load(Ordering::Acquire) {
                self.filter_close.store(true, Ordering::Release);
            }
            self.stream_gen.fetch_add(1, Ordering::AcqRel);
            (self.post.drain(), buffers.destroy_all())
        };
        info!(
            "drained after close: {} queued frames dropped, {} buffers destroyed",
            queued, destroyed
        );

        self.closing.store(false, Ordering::Release);
        let mut done = self.drained.lock();
        *done = true;
        self.drained_cv.notify_all();
    }

    fn filter_loop(self: Arc<Self>, mut graph: Box<dyn FilterGraph>) {
        info!("filter thread started ({})", graph.name());

        'run: while !self.shutdown.load(Ordering::Acquire) {
            let input = if self.filter_close.load(Ordering::Acquire) {
                let n = self.pre.drain();
                debug!("filter flush, {} queued frames dropped", n);
                None
            } else {
                match self.pre.pop() {
                    Some(frame) => Some(frame),
                    None => {
                        self.poll();
                        continue;
                    }
                }
            };

            let flushing = input.is_none();
            if let Err(e) = graph.send(input) {
                error!("cannot feed filter graph: {}", e);
                if flushing {
                    break;
                }
                continue;
            }

            loop {
                match graph.receive() {
                    Ok(FilterOutput::Frame(out)) => self.deliver_filtered(out),
                    Ok(FilterOutput::Again) => break,
                    Ok(FilterOutput::Eof) => break 'run,
                    Err(e) => {
                        error!("filter graph failed: {}", e);
                        break;
                    }
                }
            }
        }

        self.filter_close.store(false, Ordering::Release);
        self.filter_active.store(false, Ordering::Release);
        info!("filter thread exit");
    }

    fn deliver_filtered(&self, frame: Frame) {
        if frame.prime_descriptor().is_none() {
            let stream_gen = self.stream_gen.load(Ordering::Acquire);
            self.upload_and_queue(&frame, stream_gen, true);
            return;
        }
        loop {
            if self.filter_close.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if !self.post.is_full() && !self.closing.load(Ordering::Acquire) {
                break;
            }
            self.poll();
        }
        self.enqueue(&self.post, frame);
    }
}
