use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use opencv::{core::Vector, imgcodecs};

use depth_vision::{
    cli::{init_logging, CommonArgs},
    device::DeviceSession,
    display::Display,
    markers::{render_marker_with_margin, MarkerDetector},
    pipeline::{ColorOrder, ColorOutput, ColorResolution, Pipeline},
};

const WINDOW_TITLE: &str = "ArUco Marker Detection";

/// Detect ArUco markers in the color camera stream and outline them.
#[derive(Debug, Parser)]
#[command(about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Write a printable image of this marker id to --marker-out and exit
    #[arg(long)]
    render_marker: Option<i32>,

    /// Output path for --render-marker
    #[arg(long, default_value = "marker.png")]
    marker_out: PathBuf,

    /// Stop after this many processed frames instead of waiting for 'q'
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.tool_config()?;

    if let Some(id) = args.render_marker {
        let marker = render_marker_with_margin(config.dictionary, id, 400, 40)
            .context("rendering marker")?;
        imgcodecs::imwrite(&args.marker_out.to_string_lossy(), &marker, &Vector::new())
            .context("writing marker image to disk")?;
        info!("wrote marker {id} to {}", args.marker_out.display());
        return Ok(());
    }

    let detector = MarkerDetector::new(config.dictionary).context("creating marker detector")?;

    let pipeline = Pipeline::new().color(
        "rgb",
        ColorResolution::The1080P,
        ColorOrder::Bgr,
        ColorOutput::Video,
    );
    let device =
        DeviceSession::open(pipeline, &config.sensors).context("Failed to open device")?;
    let rgb = device.output_queue("rgb", config.queue_depth, false)?;

    let mut display = Display::new(args.common.headless);
    let mut processed = 0u64;

    loop {
        let Some(mut frame) = rgb.try_get().context("Failed to read frame from camera")? else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };

        let markers = detector
            .detect(frame.cv_frame())
            .context("Marker detection failed")?;
        if !markers.is_empty() {
            debug!("frame #{}: markers {:?}", frame.sequence, markers.ids());
            markers
                .draw(frame.cv_frame_mut())
                .context("drawing markers")?;
        }

        display.show(WINDOW_TITLE, frame.cv_frame())?;
        processed += 1;

        if display.poll_quit()? || args.max_frames.is_some_and(|max| processed >= max) {
            break;
        }
    }

    Ok(())
}
