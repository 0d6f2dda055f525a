//! kmsvideo: play a test pattern through the KMS video pipeline.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kmsvideo::kms::{DisplayLayout, KmsDevice, VirtualCard};
use kmsvideo::source::{TestPattern, WallClock};
use kmsvideo::video::PlanarFormat;
use kmsvideo::{utils, Config, RenderContext};

#[derive(Parser, Debug)]
#[command(version, about = "Render a test pattern on a DRM/KMS display")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-memory display instead of a real card
    #[arg(long = "virtual")]
    virtual_card: bool,

    /// Card node, overrides the configuration
    #[arg(long)]
    card: Option<PathBuf>,

    /// Seconds to play; runs until Ctrl-C when unset
    #[arg(short, long)]
    duration: Option<u64>,

    #[arg(long, default_value_t = 50)]
    fps: u32,

    #[arg(long, default_value_t = 720)]
    width: u32,

    #[arg(long, default_value_t = 576)]
    height: u32,

    /// Mark frames interlaced so they go through the deinterlacer
    #[arg(long)]
    interlaced: bool,

    /// Produce YUV420P instead of NV12
    #[arg(long)]
    yuv420p: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kmsvideo=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    let args = Args::parse();

    info!("kmsvideo launching...");
    let mut config = Config::load(args.config.as_deref())?;
    if args.card.is_some() {
        config.device.path = args.card.clone();
    }

    let card: Arc<dyn KmsDevice> = if args.virtual_card {
        info!("Using virtual display");
        Arc::new(VirtualCard::new())
    } else {
        Arc::new(utils::open_card(&config.device)?)
    };
    let layout = DisplayLayout::probe(card.as_ref(), &config.device.modes)?;
    let clock = Arc::new(WallClock::new());
    let render = Arc::new(RenderContext::new(card, layout, &config, clock)?);

    let screen = render.get_screen_size();
    info!("screen {}x{}", screen.width, screen.height);

    let format = if args.yuv420p {
        PlanarFormat::Yuv420p
    } else {
        PlanarFormat::Nv12
    };
    let mut pattern = TestPattern::new(args.width, args.height, args.fps)
        .interlaced(args.interlaced)
        .format(format);

    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let render = render.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let time_base = pattern.time_base();
            let mut count = 0;
            while !stop.load(Ordering::Acquire) {
                render.render_frame(time_base, pattern.next_frame())?;
                count += 1;
            }
            Ok(count)
        })
    };

    match args.duration {
        Some(secs) => tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("{} s elapsed", secs),
        },
        None => tokio::signal::ctrl_c().await?,
    }

    stop.store(true, Ordering::Release);
    let frames = match producer.await? {
        Ok(n) => n,
        Err(e) => {
            error!("producer failed: {:#}", e);
            0
        }
    };
    let stats = render.get_stats();
    {
        let render = render.clone();
        tokio::task::spawn_blocking(move || render.set_closing()).await?;
    }
    println!(
        "frames sent {}, shown {}, dropped {}, duplicated {}",
        frames, stats.start_count, stats.dropped, stats.duplicated
    );

    render.shutdown();
    info!("kmsvideo shutting down");
    Ok(())
}
