use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use depth_vision::{
    cli::{init_logging, CommonArgs},
    device::DeviceSession,
    display::Display,
    pipeline::{ColorOrder, ColorOutput, ColorResolution, Pipeline},
    tracking::MotionTracker,
};

const WINDOW_TITLE: &str = "Real-time Object Tracker (with SIFT and Clustering)";

/// Outline regions of the color stream that match the previous frame.
#[derive(Debug, Parser)]
#[command(about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Stop after this many frames instead of waiting for 'q'
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.tool_config()?;

    let mut tracker = MotionTracker::new(config.tracker).context("creating motion tracker")?;

    let pipeline = Pipeline::new().color(
        "rgb",
        ColorResolution::The1080P,
        ColorOrder::Bgr,
        ColorOutput::Preview {
            width: 640,
            height: 480,
        },
    );
    let device =
        DeviceSession::open(pipeline, &config.sensors).context("Failed to open device")?;
    let rgb = device.output_queue("rgb", config.queue_depth, false)?;

    let mut display = Display::new(args.common.headless);
    let mut processed = 0u64;

    loop {
        let mut frame = rgb.get().context("Failed to read frame from camera")?;

        let rects = tracker
            .process(frame.cv_frame_mut())
            .context("Motion clustering failed")?;
        debug!("frame #{}: {} clusters", frame.sequence, rects.len());

        display.show(WINDOW_TITLE, frame.cv_frame())?;
        processed += 1;

        if display.poll_quit()? || args.max_frames.is_some_and(|max| processed >= max) {
            break;
        }
    }

    Ok(())
}
