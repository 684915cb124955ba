use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use depth_vision::{
    cli::{init_logging, CommonArgs},
    device::DeviceSession,
    display::Display,
    pipeline::{BoardSocket, MonoResolution, Pipeline},
    storage::{ImageSaver, MONO_LEFT_DIR},
};

/// Show the left mono camera and save every frame as a PNG.
#[derive(Debug, Parser)]
#[command(about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Directory the frames are written to
    #[arg(short, long, default_value = MONO_LEFT_DIR)]
    out_dir: PathBuf,

    /// Stop after this many frames instead of waiting for 'q'
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.tool_config()?;

    let pipeline = Pipeline::new().mono("left", BoardSocket::Left, MonoResolution::The720P);
    let device =
        DeviceSession::open(pipeline, &config.sensors).context("Failed to open device")?;
    let left = device.output_queue("left", config.queue_depth, false)?;

    let saver = ImageSaver::new(&args.out_dir).context("creating output directory")?;
    let mut display = Display::new(args.common.headless);
    let mut saved = 0u64;

    loop {
        let frame = left.get().context("Failed to read frame from camera")?;

        display.show("left", frame.cv_frame())?;
        saver
            .save(frame.cv_frame(), frame.timestamp_millis())
            .context("writing frame to disk")?;
        saved += 1;

        if display.poll_quit()? || args.max_frames.is_some_and(|max| saved >= max) {
            break;
        }
    }

    info!("saved {saved} frames to {}", saver.dir().display());
    Ok(())
}
