use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kmsvideo::display::ZposState;
use kmsvideo::kms::virt::VirtualOptions;
use kmsvideo::kms::{DisplayLayout, Fourcc, VirtualCard};
use kmsvideo::source::TestPattern;
use kmsvideo::video::{PlanarFormat, PrimeDescriptor, PrimeObject, PrimePlane};
use kmsvideo::{AudioClock, Config, Frame, Rational, RenderContext, Stats};

const MS: Rational = Rational::new(1, 1000);
const NO_AUDIO: i64 = i64::MIN;

/// Audio clock the test moves by hand.
struct TestClock {
    audio: AtomicI64,
}

impl TestClock {
    fn at(ms: i64) -> Arc<Self> {
        Arc::new(Self {
            audio: AtomicI64::new(ms),
        })
    }

    fn set(&self, ms: i64) {
        self.audio.store(ms, Ordering::SeqCst);
    }
}

impl AudioClock for TestClock {
    fn clock(&self) -> Option<i64> {
        match self.audio.load(Ordering::SeqCst) {
            NO_AUDIO => None,
            ms => Some(ms),
        }
    }

    fn video_ready(&self, _video_ms: i64) -> bool {
        true
    }
}

struct Harness {
    card: Arc<VirtualCard>,
    render: Arc<RenderContext>,
    video_plane: u32,
    osd_plane: u32,
    // dma-buf stand-ins; kept open for the lifetime of the test
    surfaces: Vec<File>,
}

fn config() -> Config {
    let mut config = Config::default();
    config.pipeline.poll_interval_ms = 1;
    config.pipeline.flip_timeout_ms = 20;
    config.sync.duplicate_wait_ms = 5;
    config.sync.audio_poll_ms = 5;
    config.sync.trick_step_ms = 1;
    config.filter.hw_deinterlace = Some(true);
    config
}

fn harness_with(config: Config, clock: Arc<TestClock>) -> Harness {
    let card = Arc::new(VirtualCard::with_options(VirtualOptions {
        refresh: Duration::from_millis(2),
        ..Default::default()
    }));
    let layout = DisplayLayout::probe(card.as_ref(), &config.device.modes).unwrap();
    let (video_plane, osd_plane) = (layout.video.id, layout.osd.id);
    let render = RenderContext::new(card.clone(), layout, &config, clock).unwrap();
    Harness {
        card,
        render: Arc::new(render),
        video_plane,
        osd_plane,
        surfaces: (0..6).map(|_| File::open("/dev/null").unwrap()).collect(),
    }
}

fn harness(clock: Arc<TestClock>) -> Harness {
    harness_with(config(), clock)
}

impl Harness {
    /// Decoder surface `index` carrying `pts` (milliseconds).
    fn prime(&self, index: usize, pts: i64) -> Frame {
        let (w, h) = (320u32, 240u32);
        let desc = PrimeDescriptor {
            objects: vec![PrimeObject {
                fd: self.surfaces[index % self.surfaces.len()].as_raw_fd(),
                size: (w * h * 3 / 2) as usize,
                modifier: 0,
            }],
            format: Fourcc::NV12,
            planes: vec![
                PrimePlane {
                    object_index: 0,
                    offset: 0,
                    pitch: w,
                },
                PrimePlane {
                    object_index: 0,
                    offset: w * h,
                    pitch: w,
                },
            ],
            owner: None,
        };
        Frame::prime(w, h, desc).with_pts(pts)
    }

    fn send(&self, frame: Frame) {
        self.render.render_frame(MS, frame).unwrap();
    }

    fn stats(&self) -> Stats {
        self.render.get_stats()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn late_frame_is_dropped() {
    let h = harness(TestClock::at(1000));
    h.send(h.prime(0, 994));
    h.send(h.prime(1, 1010));
    h.send(h.prime(2, 1011));

    // the drop itself counts as the stream start
    assert!(wait_until(|| h.stats().start_count == 3));
    let stats = h.stats();
    assert_eq!((stats.dropped, stats.duplicated), (1, 0));
    assert_eq!(h.render.get_clock(), Some(1011));
    assert_ne!(h.render.last_displayed(), h.render.black_fb());
}

#[test]
fn early_frame_waits_for_audio() {
    let clock = TestClock::at(1000);
    let h = harness(clock.clone());
    h.send(h.prime(0, 1036));
    h.send(h.prime(1, 1040));

    assert!(wait_until(|| h.stats().duplicated >= 2));
    assert_eq!(h.stats().start_count, 0);

    clock.set(1030);
    assert!(wait_until(|| h.stats().start_count == 2));
    assert_eq!(h.stats().dropped, 0);
}

#[test]
fn far_apart_clocks_still_display() {
    let h = harness(TestClock::at(1000));
    h.send(h.prime(0, 7000));
    h.send(h.prime(1, 7001));

    assert!(wait_until(|| h.stats().start_count == 2));
    let stats = h.stats();
    assert_eq!((stats.dropped, stats.duplicated), (0, 0));
}

#[test]
fn missing_audio_holds_the_stream() {
    let clock = TestClock::at(NO_AUDIO);
    let h = harness(clock.clone());
    h.send(h.prime(0, 1000));
    h.send(h.prime(1, 1020));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.stats(), Stats::default());

    clock.set(1000);
    assert!(wait_until(|| h.stats().start_count == 2));
}

#[test]
fn audio_delay_shifts_sync() {
    let h = harness(TestClock::at(1000));
    h.render.set_audio_delay(40);
    h.send(h.prime(0, 1010));
    h.send(h.prime(1, 1040));
    h.send(h.prime(2, 1045));

    assert!(wait_until(|| h.stats().start_count == 3));
    assert_eq!(h.stats().dropped, 1);
}

#[test]
fn close_shows_black_and_releases_buffers() {
    let h = harness(TestClock::at(1000));
    for (i, pts) in [1000, 1001, 1002].into_iter().enumerate() {
        h.send(h.prime(i, pts));
    }
    assert!(wait_until(|| h.stats().start_count == 3));
    assert_eq!(h.render.pool_len(), 3);

    h.render.set_closing();
    assert_eq!(h.render.pool_len(), 0);
    assert!(!h.render.is_closing());
    assert_eq!(h.render.last_displayed(), h.render.black_fb());
    assert_eq!(
        h.card.value(h.video_plane, "FB_ID"),
        Some(h.render.black_fb() as u64)
    );
    assert_eq!(h.stats(), Stats::default());
    assert_eq!(h.render.get_clock(), None);
    // OSD and black are all that is left
    assert_eq!(h.card.framebuffer_count(), 2);

    // the next stream starts from scratch
    h.send(h.prime(3, 1000));
    h.send(h.prime(4, 1001));
    assert!(wait_until(|| h.stats().start_count == 2));
    assert_eq!(h.render.pool_len(), 2);
}

#[test]
fn still_picture_after_close_is_shown() {
    let h = harness(TestClock::at(1000));
    h.send(h.prime(0, 1000));
    h.send(h.prime(1, 1001));
    assert!(wait_until(|| h.stats().start_count == 2));
    h.render.set_closing();
    assert_eq!(h.render.last_displayed(), h.render.black_fb());

    // one frame and nothing after it
    let still = h.prime(2, 1000);
    h.send(still);
    assert!(wait_until(|| h.render.last_displayed() != h.render.black_fb()));
    assert_eq!(h.stats().start_count, 1);
}

#[test]
fn close_without_buffers_does_not_wait() {
    let h = harness(TestClock::at(1000));
    h.render.set_trick_speed(2);

    let start = Instant::now();
    h.render.set_closing();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(h.stats(), Stats::default());
    assert_eq!(h.card.framebuffer_count(), 2);
}

#[test]
fn osd_moves_above_the_video() {
    let h = harness(TestClock::at(NO_AUDIO));
    h.render.set_trick_speed(1);

    let stop = Arc::new(AtomicBool::new(false));
    let feeder = {
        let render = h.render.clone();
        let frames: Vec<Frame> = (0..3).map(|i| h.prime(i, i as i64)).collect();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut n = 0;
            while !stop.load(Ordering::SeqCst) {
                render.render_frame(MS, frames[n % 3].clone()).unwrap();
                n += 1;
            }
        })
    };

    assert!(wait_until(|| h.render.last_displayed() != h.render.black_fb()));
    assert_eq!(h.card.value(h.video_plane, "zpos"), Some(1));
    assert_eq!(h.render.zpos_state(), ZposState::VideoOnTop);

    let square = vec![0xffu8; 16 * 16 * 4];
    h.render.osd_draw_argb(0, 0, 16, 16, 16 * 4, &square, 100, 100);
    assert!(wait_until(|| h.render.zpos_state() == ZposState::OsdOnTop));
    assert_eq!(h.card.value(h.osd_plane, "zpos"), Some(1));
    assert_eq!(h.card.value(h.video_plane, "zpos"), Some(0));

    h.render.osd_clear();
    assert!(wait_until(|| h.render.zpos_state() == ZposState::VideoOnTop));
    assert_eq!(h.card.value(h.video_plane, "zpos"), Some(1));
    assert_eq!(h.card.value(h.osd_plane, "zpos"), Some(0));

    stop.store(true, Ordering::SeqCst);
    feeder.join().unwrap();
    // trick play never counts frames
    assert_eq!(h.stats().start_count, 0);
}

#[test]
fn rejected_commits_are_survived() {
    let h = harness(TestClock::at(1000));
    h.card.fail_commits(2);
    for (i, pts) in [1000, 1001, 1002, 1003].into_iter().enumerate() {
        h.send(h.prime(i, pts));
    }
    assert!(wait_until(|| h.render.last_displayed() != h.render.black_fb()));
    assert!(wait_until(|| h.stats().start_count == 4));
}

#[test]
fn pause_holds_until_play() {
    let h = harness(TestClock::at(1000));
    h.render.pause();
    h.send(h.prime(0, 1000));
    h.send(h.prime(1, 1001));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.stats().start_count, 0);
    assert_eq!(h.render.last_displayed(), h.render.black_fb());

    h.render.play();
    assert!(wait_until(|| h.stats().start_count == 2));
}

#[test]
fn software_frames_are_uploaded() {
    let h = harness(TestClock::at(i64::MAX / 2));
    let mut pattern = TestPattern::new(64, 32, 50);
    for _ in 0..4 {
        h.render.render_frame(pattern.time_base(), pattern.next_frame()).unwrap();
    }

    assert!(wait_until(|| h.stats().start_count >= 3));
    // ring capacity plus two upload buffers
    assert_eq!(h.render.pool_len(), 5);

    h.render.set_closing();
    assert_eq!(h.render.pool_len(), 0);
}

#[test]
fn interlaced_software_frames_double_the_rate() {
    let h = harness(TestClock::at(i64::MAX / 2));
    let mut pattern = TestPattern::new(64, 32, 25)
        .format(PlanarFormat::Yuv420p)
        .interlaced(true);
    for _ in 0..4 {
        h.render.render_frame(pattern.time_base(), pattern.next_frame()).unwrap();
    }

    // the last input is held back until the next one arrives
    assert!(wait_until(|| h.stats().start_count == 6));
    assert_eq!(h.stats().dropped, 0);

    h.render.set_closing();
    assert_eq!(h.render.pool_len(), 0);
}

#[test]
fn interlaced_surfaces_bypass_a_missing_deinterlacer() {
    let h = harness(TestClock::at(1000));
    for (i, pts) in [1000, 1001, 1002].into_iter().enumerate() {
        let mut frame = h.prime(i, pts);
        frame.interlaced = true;
        h.send(frame);
    }

    // the first frame is lost while the filter is tried
    assert!(wait_until(|| h.stats().start_count == 2));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(h.stats().start_count, 2);
    assert_eq!(h.stats().dropped, 0);
}

#[test]
fn screen_and_format_queries() {
    let h = harness(TestClock::at(0));
    let screen = h.render.get_screen_size();
    assert_eq!((screen.width, screen.height), (1920, 1080));
    assert!((screen.pixel_aspect - 16.0 / 9.0).abs() < 1e-9);

    use kmsvideo::PixelFormat::*;
    assert_eq!(h.render.get_format(&[Yuv420p, DrmPrime], |c| c[0]), DrmPrime);
    assert_eq!(h.render.get_format(&[Nv12, Yuv420p], |c| c[0]), Yuv420p);
}

#[test]
fn shutdown_restores_the_crtc() {
    let h = harness(TestClock::at(1000));
    let before = h.card.saved_crtc();
    h.send(h.prime(0, 1000));
    h.send(h.prime(1, 1001));
    assert!(wait_until(|| h.stats().start_count == 2));

    h.render.shutdown();
    assert_eq!(h.card.saved_crtc().fb_id, before.fb_id);
    assert_eq!(h.card.framebuffer_count(), 0);
    assert_eq!(h.card.dumb_count(), 0);
}
