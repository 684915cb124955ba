use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use depth_vision::{
    cli::{init_logging, CommonArgs},
    device::DeviceSession,
    display::Display,
    pipeline::{BoardSocket, ColorOrder, ColorOutput, ColorResolution, MonoResolution, Pipeline},
    storage::{ImageSaver, STEREO_BASE_DIR, STEREO_LEFT_SUBDIR, STEREO_RIGHT_SUBDIR},
};

/// Capture left/right pairs from the stereo cameras and save them with a
/// shared timestamp.
#[derive(Debug, Parser)]
#[command(about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Base directory; pairs go to <out-dir>/images_left and <out-dir>/images_right
    #[arg(short, long, default_value = STEREO_BASE_DIR)]
    out_dir: PathBuf,

    /// Number of pairs to capture
    #[arg(short = 'n', long, default_value_t = 2)]
    count: u64,

    /// Override the warm-up delay before capturing, in milliseconds
    #[arg(long)]
    warmup_ms: Option<u64>,

    /// Also declare the color and depth streams
    #[arg(long)]
    full_pipeline: bool,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.tool_config()?;

    let mut pipeline = Pipeline::new()
        .mono("left", BoardSocket::Left, MonoResolution::The400P)
        .mono("right", BoardSocket::Right, MonoResolution::The400P);
    if args.full_pipeline {
        pipeline = pipeline
            .color(
                "rgb",
                ColorResolution::The720P,
                ColorOrder::Bgr,
                ColorOutput::Preview {
                    width: 640,
                    height: 480,
                },
            )
            .stereo_depth("depth", "left", "right", config.stereo);
    }

    let device =
        DeviceSession::open(pipeline, &config.sensors).context("Failed to open device")?;
    let left = device.output_queue("left", config.queue_depth, false)?;
    let right = device.output_queue("right", config.queue_depth, false)?;
    if args.full_pipeline {
        device.output_queue("rgb", config.queue_depth, false)?;
        device.output_queue("depth", config.queue_depth, false)?;
    }

    let warmup = Duration::from_millis(args.warmup_ms.unwrap_or(config.warmup_ms));
    device.start();
    info!("waiting {warmup:?} for the cameras to stabilize");
    thread::sleep(warmup);

    let left_saver = ImageSaver::new(args.out_dir.join(STEREO_LEFT_SUBDIR))
        .context("creating left output directory")?;
    let right_saver = ImageSaver::new(args.out_dir.join(STEREO_RIGHT_SUBDIR))
        .context("creating right output directory")?;
    let mut display = Display::new(args.common.headless);

    for pair in 0..args.count {
        let frame_left = left.get().context("Failed to read left frame")?;
        let frame_right = right.get().context("Failed to read right frame")?;

        display.show("left", frame_left.cv_frame())?;
        display.show("right", frame_right.cv_frame())?;

        let timestamp = frame_left.timestamp_millis();
        left_saver
            .save(frame_left.cv_frame(), timestamp)
            .context("writing left frame to disk")?;
        right_saver
            .save(frame_right.cv_frame(), timestamp)
            .context("writing right frame to disk")?;
        info!("saved pair {} of {} at {timestamp}", pair + 1, args.count);

        if display.poll_quit()? {
            break;
        }
    }

    Ok(())
}
