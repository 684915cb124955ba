//! Scoped device session.
//!
//! `DeviceSession::open` opens every sensor a pipeline needs and hands them to
//! a single pump thread. Each tick the pump reads one raw frame per sensor,
//! turns it into the per-stream outputs the pipeline declares, and pushes them
//! into bounded output queues. The host reads those queues with `get` (wait
//! indefinitely) or `try_get` (return immediately).
//!
//! The pump does not start ticking until the host first reads a queue (or
//! calls `start`), so all queues requested up front see the same first frame. Dropping the session
//! stops and joins the pump, which releases the sensors.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use log::{debug, error, info, warn};
use opencv::{
    calib3d::{self, StereoSGBM},
    core::{self, Mat, Ptr, Rect, Size},
    imgproc,
    prelude::*,
};
use thiserror::Error;

use crate::{
    frame::Frame,
    pipeline::{
        BoardSocket, ColorOrder, ColorOutput, Node, Pipeline, PipelineError, StereoDepthConfig,
    },
    source::{SensorBindings, SensorSource},
};

/// Queue depth used by every tool unless configured otherwise.
pub const DEFAULT_QUEUE_SIZE: usize = 4;

const PUSH_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to open sensor source {source_name}")]
    Open { source_name: String },
    #[error("no source bound to the {0:?} socket")]
    Unbound(BoardSocket),
    #[error("sensor source {source_name} failed: {reason}")]
    Source { source_name: String, reason: String },
    #[error("stream {0:?} is not part of the pipeline")]
    UnknownStream(String),
    #[error("stream {stream:?} closed: {reason}")]
    Closed { stream: String, reason: String },
    #[error("output queue size must be at least 1")]
    ZeroQueueSize,
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

struct QueueSender {
    tx: Sender<Frame>,
    // Held so a full non-blocking queue can evict its oldest frame.
    rx: Receiver<Frame>,
    blocking: bool,
    max_size: usize,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueSender>>,
    stop: AtomicBool,
    finished: AtomicBool,
    failure: Mutex<Option<String>>,
    started: AtomicBool,
    start_signal: Mutex<Option<Sender<()>>>,
}

impl Shared {
    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender wakes the pump.
        if let Ok(mut signal) = self.start_signal.lock() {
            signal.take();
        }
    }

    fn close_reason(&self) -> String {
        self.failure
            .lock()
            .ok()
            .and_then(|failure| failure.clone())
            .unwrap_or_else(|| "device stopped".to_string())
    }
}

/// A bounded, named queue of frames from one stream.
pub struct OutputQueue {
    name: String,
    rx: Receiver<Frame>,
    shared: Arc<Shared>,
}

impl OutputQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the next frame arrives.
    pub fn get(&self) -> Result<Frame, DeviceError> {
        self.shared.ensure_started();
        self.rx.recv().map_err(|_| self.closed())
    }

    /// Return the next queued frame, or `None` if nothing is queued right now.
    pub fn try_get(&self) -> Result<Option<Frame>, DeviceError> {
        self.shared.ensure_started();
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed()),
        }
    }

    /// Like `get`, giving up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<Frame>, DeviceError> {
        self.shared.ensure_started();
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed()),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn closed(&self) -> DeviceError {
        DeviceError::Closed {
            stream: self.name.clone(),
            reason: self.shared.close_reason(),
        }
    }
}

/// An open connection to the camera for one pipeline.
pub struct DeviceSession {
    pipeline: Pipeline,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
}

impl DeviceSession {
    pub fn open(pipeline: Pipeline, bindings: &SensorBindings) -> Result<Self, DeviceError> {
        pipeline.validate()?;

        let mut sources = BTreeMap::new();
        for socket in pipeline.sockets() {
            let spec = bindings.get(socket).ok_or(DeviceError::Unbound(socket))?;
            let frame_size = pipeline
                .streams
                .iter()
                .find(|stream| stream.node.socket() == Some(socket))
                .and_then(|stream| pipeline.frame_size(&stream.name));
            let source = spec.open(frame_size)?;
            info!("{socket:?} sensor bound to {}", source.describe());
            sources.insert(socket, source);
        }

        Self::open_with_sources(pipeline, sources)
    }

    /// Open a session over already constructed sensor sources.
    pub fn open_with_sources(
        pipeline: Pipeline,
        mut sources: BTreeMap<BoardSocket, Box<dyn SensorSource>>,
    ) -> Result<Self, DeviceError> {
        pipeline.validate()?;

        for socket in pipeline.sockets() {
            if !sources.contains_key(&socket) {
                return Err(DeviceError::Unbound(socket));
            }
        }
        let needed = pipeline.sockets();
        sources.retain(|socket, _| needed.contains(socket));

        let (start_tx, start_rx) = bounded::<()>(0);
        let shared = Arc::new(Shared {
            start_signal: Mutex::new(Some(start_tx)),
            ..Shared::default()
        });

        let mut pump = Pump::new(&pipeline, sources, Arc::clone(&shared))?;
        let handle = thread::Builder::new()
            .name("device-pump".to_string())
            .spawn(move || {
                let _ = start_rx.recv();
                pump.run();
            })
            .map_err(|err| DeviceError::Source {
                source_name: "device pump".to_string(),
                reason: err.to_string(),
            })?;

        info!(
            "device session opened with streams {:?}",
            pipeline.streams.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );

        Ok(DeviceSession {
            pipeline,
            shared,
            pump: Some(handle),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Start the device without reading a queue, e.g. to let sensors settle.
    pub fn start(&self) {
        self.shared.ensure_started();
    }

    /// Get the output queue of a stream, creating it on first request.
    ///
    /// Later requests for the same stream share the first queue and its
    /// settings. A non-blocking queue overwrites its oldest frame when full; a
    /// blocking queue stalls the device until the host catches up.
    pub fn output_queue(
        &self,
        name: &str,
        max_size: usize,
        blocking: bool,
    ) -> Result<OutputQueue, DeviceError> {
        if self.pipeline.stream(name).is_none() {
            return Err(DeviceError::UnknownStream(name.to_string()));
        }
        if max_size == 0 {
            return Err(DeviceError::ZeroQueueSize);
        }

        let mut queues = self
            .shared
            .queues
            .lock()
            .map_err(|_| DeviceError::Closed {
                stream: name.to_string(),
                reason: "device pump panicked".to_string(),
            })?;

        if let Some(existing) = queues.get(name) {
            if existing.max_size != max_size || existing.blocking != blocking {
                warn!(
                    "output queue {name:?} already exists with max_size={} blocking={}, ignoring new settings",
                    existing.max_size, existing.blocking
                );
            }
            return Ok(OutputQueue {
                name: name.to_string(),
                rx: existing.rx.clone(),
                shared: Arc::clone(&self.shared),
            });
        }

        let (tx, rx) = bounded(max_size);
        if self.shared.finished.load(Ordering::SeqCst) {
            // The pump is gone; the dropped sender makes reads report closure.
            drop(tx);
        } else {
            queues.insert(
                name.to_string(),
                QueueSender {
                    tx,
                    rx: rx.clone(),
                    blocking,
                    max_size,
                },
            );
        }

        Ok(OutputQueue {
            name: name.to_string(),
            rx,
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Ok(mut signal) = self.shared.start_signal.lock() {
            signal.take();
        }
        if let Some(handle) = self.pump.take() {
            if handle.join().is_err() {
                error!("device pump panicked");
            }
        }
        info!("device session closed");
    }
}

enum Route {
    Mono {
        stream: String,
        socket: BoardSocket,
        size: (i32, i32),
    },
    Color {
        stream: String,
        socket: BoardSocket,
        size: (i32, i32),
        color_order: ColorOrder,
        output: ColorOutput,
    },
    Depth {
        stream: String,
        left: String,
        right: String,
        subpixel: bool,
        matcher: Ptr<StereoSGBM>,
    },
}

struct Pump {
    sources: BTreeMap<BoardSocket, Box<dyn SensorSource>>,
    routes: Vec<Route>,
    shared: Arc<Shared>,
    sequence: u64,
}

impl Pump {
    fn new(
        pipeline: &Pipeline,
        sources: BTreeMap<BoardSocket, Box<dyn SensorSource>>,
        shared: Arc<Shared>,
    ) -> Result<Self, DeviceError> {
        let mut routes = Vec::with_capacity(pipeline.streams.len());

        for stream in &pipeline.streams {
            let route = match &stream.node {
                Node::MonoCamera { socket, resolution } => Route::Mono {
                    stream: stream.name.clone(),
                    socket: *socket,
                    size: resolution.size(),
                },
                Node::ColorCamera {
                    socket,
                    resolution,
                    color_order,
                    output,
                } => Route::Color {
                    stream: stream.name.clone(),
                    socket: *socket,
                    size: resolution.size(),
                    color_order: *color_order,
                    output: *output,
                },
                Node::StereoDepth {
                    left,
                    right,
                    config,
                } => Route::Depth {
                    stream: stream.name.clone(),
                    left: left.clone(),
                    right: right.clone(),
                    subpixel: config.subpixel,
                    matcher: create_stereo_matcher(config)?,
                },
            };
            routes.push(route);
        }

        // Depth routes consume the mono outputs of the same tick.
        routes.sort_by_key(|route| matches!(route, Route::Depth { .. }));

        Ok(Pump {
            sources,
            routes,
            shared,
            sequence: 0,
        })
    }

    fn run(&mut self) {
        while !self.shared.stop.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(true) => {}
                Ok(false) => {
                    info!("sensor reached end of stream, stopping device");
                    self.fail("sensor reached end of stream".to_string());
                    break;
                }
                Err(err) => {
                    error!("device pump stopped: {err}");
                    self.fail(err.to_string());
                    break;
                }
            }
        }

        // Dropping the senders disconnects every queue once it is drained.
        match self.shared.queues.lock() {
            Ok(mut queues) => {
                queues.clear();
                self.shared.finished.store(true, Ordering::SeqCst);
            }
            Err(_) => self.shared.finished.store(true, Ordering::SeqCst),
        }
    }

    fn fail(&self, reason: String) {
        if let Ok(mut failure) = self.shared.failure.lock() {
            failure.get_or_insert(reason);
        }
    }

    /// Run one device tick. Returns `false` once any sensor has ended.
    fn tick(&mut self) -> Result<bool, DeviceError> {
        let mut raw = BTreeMap::new();
        for (socket, source) in self.sources.iter_mut() {
            match source.read()? {
                Some(mat) => {
                    raw.insert(*socket, mat);
                }
                None => return Ok(false),
            }
        }

        let sequence = self.sequence;
        self.sequence += 1;
        let captured_at = Utc::now();

        let mut outputs: HashMap<String, Mat> = HashMap::new();
        for route in self.routes.iter_mut() {
            let (stream, mat) = match route {
                Route::Mono {
                    stream,
                    socket,
                    size,
                } => (stream.as_str(), mono_output(&raw[&*socket], *size)?),
                Route::Color {
                    stream,
                    socket,
                    size,
                    color_order,
                    output,
                } => (
                    stream.as_str(),
                    color_output(&raw[&*socket], *size, *color_order, *output)?,
                ),
                Route::Depth {
                    stream,
                    left,
                    right,
                    subpixel,
                    matcher,
                } => {
                    let (Some(left), Some(right)) =
                        (outputs.get(left.as_str()), outputs.get(right.as_str()))
                    else {
                        continue;
                    };
                    (
                        stream.as_str(),
                        depth_output(matcher, left, right, *subpixel)?,
                    )
                }
            };
            outputs.insert(stream.to_string(), mat);
        }

        for (stream, mat) in outputs {
            self.push(Frame::new(&stream, sequence, captured_at, mat));
        }

        Ok(true)
    }

    fn push(&self, frame: Frame) {
        let queues = match self.shared.queues.lock() {
            Ok(queues) => queues,
            Err(_) => return,
        };
        // Streams nobody asked for are discarded.
        let Some(queue) = queues.get(&frame.stream) else {
            return;
        };

        if queue.blocking {
            let tx = queue.tx.clone();
            // Release the lock while waiting so the host can still open queues.
            drop(queues);
            let mut pending = frame;
            loop {
                match tx.send_timeout(pending, PUSH_RETRY_INTERVAL) {
                    Ok(()) => return,
                    Err(SendTimeoutError::Timeout(frame)) => {
                        if self.shared.stop.load(Ordering::SeqCst) {
                            return;
                        }
                        pending = frame;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return,
                }
            }
        }

        match queue.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(dropped) = queue.rx.try_recv() {
                    debug!(
                        "queue {:?} full, dropped frame #{}",
                        dropped.stream, dropped.sequence
                    );
                }
                if queue.tx.try_send(frame).is_err() {
                    warn!("queue overflow, frame lost");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Single-channel 8-bit image at the configured mono resolution.
fn mono_output(raw: &Mat, size: (i32, i32)) -> Result<Mat, DeviceError> {
    let gray = to_gray(raw)?;
    resize_to(&gray, size)
}

fn color_output(
    raw: &Mat,
    size: (i32, i32),
    color_order: ColorOrder,
    output: ColorOutput,
) -> Result<Mat, DeviceError> {
    let bgr = to_bgr(raw)?;
    let mut image = resize_to(&bgr, size)?;

    if let ColorOutput::Preview { width, height } = output {
        image = resize_to(&center_crop(&image, width, height)?, (width, height))?;
    }

    if color_order == ColorOrder::Rgb {
        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&image, &mut rgb, imgproc::COLOR_BGR2RGB)?;
        image = rgb;
    }

    Ok(image)
}

/// 16-bit disparity from a rectified left/right pair.
fn depth_output(
    matcher: &mut Ptr<StereoSGBM>,
    left: &Mat,
    right: &Mat,
    subpixel: bool,
) -> Result<Mat, DeviceError> {
    let mut disparity = Mat::default();
    matcher.compute(left, right, &mut disparity)?;

    // The matcher returns signed disparity with 4 fractional bits; invalid
    // pixels are negative and saturate to zero.
    let scale = if subpixel { 1.0 } else { 1.0 / 16.0 };
    let mut out = Mat::default();
    disparity.convert_to(&mut out, core::CV_16U, scale, 0.0)?;
    Ok(out)
}

fn create_stereo_matcher(config: &StereoDepthConfig) -> Result<Ptr<StereoSGBM>, DeviceError> {
    const BLOCK_SIZE: i32 = 5;
    const NUM_DISPARITIES: i32 = 96;

    let disp12_max_diff = if config.left_right_check { 1 } else { -1 };

    let matcher = StereoSGBM::create(
        0,
        NUM_DISPARITIES,
        BLOCK_SIZE,
        8 * BLOCK_SIZE * BLOCK_SIZE,
        32 * BLOCK_SIZE * BLOCK_SIZE,
        disp12_max_diff,
        63,
        uniqueness_ratio(config.confidence_threshold),
        100,
        2,
        calib3d::StereoSGBM_MODE_SGBM,
    )?;
    Ok(matcher)
}

/// Map a 0..=255 confidence threshold onto the matcher's uniqueness margin
/// (percent). 255 disables the filter.
pub(crate) fn uniqueness_ratio(confidence_threshold: u8) -> i32 {
    (255 - confidence_threshold as i32) * 15 / 255
}

pub(crate) fn to_gray(image: &Mat) -> Result<Mat, opencv::Error> {
    let code = match image.channels() {
        1 => return Ok(image.clone()),
        4 => imgproc::COLOR_BGRA2GRAY,
        _ => imgproc::COLOR_BGR2GRAY,
    };
    let mut gray = Mat::default();
    imgproc::cvt_color_def(image, &mut gray, code)?;
    Ok(gray)
}

fn to_bgr(image: &Mat) -> Result<Mat, opencv::Error> {
    let code = match image.channels() {
        3 => return Ok(image.clone()),
        1 => imgproc::COLOR_GRAY2BGR,
        _ => imgproc::COLOR_BGRA2BGR,
    };
    let mut bgr = Mat::default();
    imgproc::cvt_color_def(image, &mut bgr, code)?;
    Ok(bgr)
}

fn resize_to(image: &Mat, (width, height): (i32, i32)) -> Result<Mat, DeviceError> {
    if image.cols() == width && image.rows() == height {
        return Ok(image.clone());
    }
    let mut resized = Mat::default();
    imgproc::resize(
        image,
        &mut resized,
        Size::new(width, height),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    Ok(resized)
}

/// Largest centered region of `image` with the aspect ratio of width:height.
fn center_crop(image: &Mat, width: i32, height: i32) -> Result<Mat, DeviceError> {
    let (cols, rows) = (image.cols(), image.rows());
    let (crop_w, crop_h) = if cols as i64 * height as i64 > rows as i64 * width as i64 {
        ((rows as i64 * width as i64 / height as i64) as i32, rows)
    } else {
        (cols, (cols as i64 * height as i64 / width as i64) as i32)
    };

    let roi = Rect::new((cols - crop_w) / 2, (rows - crop_h) / 2, crop_w, crop_h);
    let mut cropped = Mat::default();
    Mat::roi(image, roi)?.copy_to(&mut cropped)?;
    Ok(cropped)
}
