//! Physical sensor sources behind a device session.
//!
//! Each `BoardSocket` a pipeline needs is bound to a `SourceSpec`. Live
//! cameras go through OpenCV `videoio`; a directory of images can stand in
//! for a sensor to replay a recorded session.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use opencv::{
    core::Mat,
    imgcodecs::{self, IMREAD_UNCHANGED},
    prelude::*,
    videoio::{self, VideoCapture},
};
use serde::{Deserialize, Serialize};

use crate::{device::DeviceError, pipeline::BoardSocket};

/// Something that yields raw frames for one sensor.
pub trait SensorSource: Send {
    /// Read the next raw frame. `None` means the source has ended.
    fn read(&mut self) -> Result<Option<Mat>, DeviceError>;

    fn describe(&self) -> String;
}

/// Where a sensor's frames come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSpec {
    /// Capture device index (`0`, `/dev/video2`).
    Device(i32),
    /// Directory of still images replayed in file-name order.
    ImageDir(PathBuf),
    /// Anything OpenCV can open as a capture: a video file, a stream URL.
    Uri(String),
}

impl SourceSpec {
    pub fn open(&self, frame_size: Option<(i32, i32)>) -> Result<Box<dyn SensorSource>, DeviceError> {
        match self {
            SourceSpec::Device(index) => {
                Ok(Box::new(VideoCaptureSource::open_index(*index, frame_size)?))
            }
            SourceSpec::ImageDir(dir) => Ok(Box::new(ImageDirSource::open(dir)?)),
            SourceSpec::Uri(uri) => Ok(Box::new(VideoCaptureSource::open_uri(uri)?)),
        }
    }
}

impl FromStr for SourceSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(index) = parse_device_index(s) {
            return Ok(SourceSpec::Device(index));
        }
        if Path::new(s).is_dir() {
            return Ok(SourceSpec::ImageDir(PathBuf::from(s)));
        }
        Ok(SourceSpec::Uri(s.to_string()))
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Device(index) => write!(f, "device #{index}"),
            SourceSpec::ImageDir(dir) => write!(f, "image directory {}", dir.display()),
            SourceSpec::Uri(uri) => write!(f, "{uri}"),
        }
    }
}

/// Parse a `/dev/videoX` style URI or a bare integer into a device index.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}

/// Which source backs each board socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorBindings(pub BTreeMap<BoardSocket, SourceSpec>);

impl Default for SensorBindings {
    fn default() -> Self {
        SensorBindings(BTreeMap::from([
            (BoardSocket::Rgb, SourceSpec::Device(0)),
            (BoardSocket::Left, SourceSpec::Device(1)),
            (BoardSocket::Right, SourceSpec::Device(2)),
        ]))
    }
}

impl SensorBindings {
    pub fn bind(&mut self, socket: BoardSocket, spec: SourceSpec) {
        self.0.insert(socket, spec);
    }

    pub fn get(&self, socket: BoardSocket) -> Option<&SourceSpec> {
        self.0.get(&socket)
    }
}

pub struct VideoCaptureSource {
    capture: VideoCapture,
    label: String,
}

impl VideoCaptureSource {
    pub fn open_index(index: i32, frame_size: Option<(i32, i32)>) -> Result<Self, DeviceError> {
        let mut capture = VideoCapture::new(index, videoio::CAP_ANY)?;
        let label = format!("device #{index}");

        if !capture.is_opened()? {
            return Err(DeviceError::Open { source_name: label });
        }

        if let Some((width, height)) = frame_size {
            // Best effort; the pump resizes whatever the driver delivers.
            let _ = capture.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64);
            let _ = capture.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64);
        }

        Ok(VideoCaptureSource { capture, label })
    }

    pub fn open_uri(uri: &str) -> Result<Self, DeviceError> {
        let capture = VideoCapture::from_file(uri, videoio::CAP_ANY)?;

        if !capture.is_opened()? {
            return Err(DeviceError::Open {
                source_name: uri.to_string(),
            });
        }

        Ok(VideoCaptureSource {
            capture,
            label: uri.to_string(),
        })
    }
}

impl SensorSource for VideoCaptureSource {
    fn read(&mut self) -> Result<Option<Mat>, DeviceError> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

pub struct ImageDirSource {
    dir: PathBuf,
    paths: std::vec::IntoIter<PathBuf>,
}

impl ImageDirSource {
    const EXTENSIONS: &'static [&'static str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

    pub fn open(dir: &Path) -> Result<Self, DeviceError> {
        let entries = std::fs::read_dir(dir).map_err(|err| DeviceError::Source {
            source_name: dir.display().to_string(),
            reason: err.to_string(),
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| Self::EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(DeviceError::Open {
                source_name: dir.display().to_string(),
            });
        }

        Ok(ImageDirSource {
            dir: dir.to_path_buf(),
            paths: paths.into_iter(),
        })
    }
}

impl SensorSource for ImageDirSource {
    fn read(&mut self) -> Result<Option<Mat>, DeviceError> {
        let Some(path) = self.paths.next() else {
            return Ok(None);
        };

        let image = imgcodecs::imread(&path.to_string_lossy(), IMREAD_UNCHANGED)?;
        if image.empty() {
            return Err(DeviceError::Source {
                source_name: path.display().to_string(),
                reason: "not a readable image".to_string(),
            });
        }
        Ok(Some(image))
    }

    fn describe(&self) -> String {
        format!("image directory {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use opencv::core::{Scalar, Vector, CV_8UC1};

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video3"), Some(3));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("/dev/videoX"), None);
        assert_eq!(parse_device_index("rtsp://camera/stream"), None);
    }

    #[test]
    fn source_spec_from_str() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        assert_eq!("2".parse::<SourceSpec>().unwrap(), SourceSpec::Device(2));
        assert_eq!(
            dir_str.parse::<SourceSpec>().unwrap(),
            SourceSpec::ImageDir(dir.path().to_path_buf())
        );
        assert_eq!(
            "recording.mp4".parse::<SourceSpec>().unwrap(),
            SourceSpec::Uri("recording.mp4".to_string())
        );
    }

    #[test]
    fn image_dir_replays_in_name_order() {
        let dir = tempfile::tempdir().unwrap();

        for (name, value) in [("b.png", 20.), ("a.png", 10.), ("c.png", 30.)] {
            let image = Mat::new_rows_cols_with_default(4, 4, CV_8UC1, Scalar::all(value)).unwrap();
            imgcodecs::imwrite(
                dir.path().join(name).to_str().unwrap(),
                &image,
                &Vector::new(),
            )
            .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        let mut values = Vec::new();
        while let Some(image) = source.read().unwrap() {
            values.push(*image.at_2d::<u8>(0, 0).unwrap());
        }

        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn empty_image_dir_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            ImageDirSource::open(dir.path()),
            Err(DeviceError::Open { .. })
        ));
    }
}
