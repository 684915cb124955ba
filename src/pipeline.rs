//! Capture configuration.
//!
//! A `Pipeline` declares which camera nodes exist, what resolution they run
//! at, and the name of the output stream each one feeds. Nothing here touches
//! a device; `DeviceSession::open` consumes a validated pipeline.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Physical sensor role on the camera board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardSocket {
    Rgb,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonoResolution {
    #[serde(rename = "400p")]
    The400P,
    #[serde(rename = "480p")]
    The480P,
    #[serde(rename = "720p")]
    The720P,
    #[serde(rename = "800p")]
    The800P,
}

impl MonoResolution {
    /// Output size as (width, height) in pixels.
    pub fn size(self) -> (i32, i32) {
        match self {
            MonoResolution::The400P => (640, 400),
            MonoResolution::The480P => (640, 480),
            MonoResolution::The720P => (1280, 720),
            MonoResolution::The800P => (1280, 800),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorResolution {
    #[serde(rename = "720p")]
    The720P,
    #[serde(rename = "1080p")]
    The1080P,
    #[serde(rename = "4k")]
    The4K,
}

impl ColorResolution {
    /// Output size as (width, height) in pixels.
    pub fn size(self) -> (i32, i32) {
        match self {
            ColorResolution::The720P => (1280, 720),
            ColorResolution::The1080P => (1920, 1080),
            ColorResolution::The4K => (3840, 2160),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorOrder {
    #[default]
    Bgr,
    Rgb,
}

/// Which output of a color camera feeds the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorOutput {
    /// Full sensor resolution.
    #[default]
    Video,
    /// Downscaled, center-cropped preview of the given size.
    Preview { width: i32, height: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoDepthConfig {
    /// 0..=255, lower keeps only more confident disparities.
    pub confidence_threshold: u8,
    pub left_right_check: bool,
    /// Keep 1/16 pixel fixed-point disparity instead of whole pixels.
    pub subpixel: bool,
}

impl Default for StereoDepthConfig {
    fn default() -> Self {
        StereoDepthConfig {
            confidence_threshold: 200,
            left_right_check: true,
            subpixel: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    MonoCamera {
        socket: BoardSocket,
        resolution: MonoResolution,
    },
    ColorCamera {
        socket: BoardSocket,
        resolution: ColorResolution,
        #[serde(default)]
        color_order: ColorOrder,
        #[serde(default)]
        output: ColorOutput,
    },
    /// Disparity computed from two mono streams of the same pipeline.
    StereoDepth {
        left: String,
        right: String,
        #[serde(default)]
        config: StereoDepthConfig,
    },
}

impl Node {
    /// The physical sensor this node reads, if it reads one directly.
    pub fn socket(&self) -> Option<BoardSocket> {
        match self {
            Node::MonoCamera { socket, .. } | Node::ColorCamera { socket, .. } => Some(*socket),
            Node::StereoDepth { .. } => None,
        }
    }
}

/// A named output channel bound to one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    pub node: Node,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stream names must not be empty")]
    EmptyName,
    #[error("stream {0:?} is declared more than once")]
    DuplicateStream(String),
    #[error("stream {stream:?}: a {node} node cannot be bound to the {socket:?} socket")]
    WrongSocket {
        stream: String,
        node: &'static str,
        socket: BoardSocket,
    },
    #[error("depth stream {stream:?} references {input:?}, which is not a mono stream")]
    BadDepthInput { stream: String, input: String },
    #[error("pipeline declares no streams")]
    Empty,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub streams: Vec<Stream>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn mono(mut self, name: &str, socket: BoardSocket, resolution: MonoResolution) -> Self {
        self.streams.push(Stream {
            name: name.to_string(),
            node: Node::MonoCamera { socket, resolution },
        });
        self
    }

    pub fn color(
        mut self,
        name: &str,
        resolution: ColorResolution,
        color_order: ColorOrder,
        output: ColorOutput,
    ) -> Self {
        self.streams.push(Stream {
            name: name.to_string(),
            node: Node::ColorCamera {
                socket: BoardSocket::Rgb,
                resolution,
                color_order,
                output,
            },
        });
        self
    }

    pub fn stereo_depth(
        mut self,
        name: &str,
        left: &str,
        right: &str,
        config: StereoDepthConfig,
    ) -> Self {
        self.streams.push(Stream {
            name: name.to_string(),
            node: Node::StereoDepth {
                left: left.to_string(),
                right: right.to_string(),
                config,
            },
        });
        self
    }

    pub fn stream(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|stream| stream.name == name)
    }

    /// Physical sensors that must be opened to run this pipeline.
    pub fn sockets(&self) -> BTreeSet<BoardSocket> {
        self.streams
            .iter()
            .filter_map(|stream| stream.node.socket())
            .collect()
    }

    /// Output size (width, height) of a stream, if it is declared.
    pub fn frame_size(&self, name: &str) -> Option<(i32, i32)> {
        match &self.stream(name)?.node {
            Node::MonoCamera { resolution, .. } => Some(resolution.size()),
            Node::ColorCamera {
                output: ColorOutput::Preview { width, height },
                ..
            } => Some((*width, *height)),
            Node::ColorCamera { resolution, .. } => Some(resolution.size()),
            Node::StereoDepth { left, .. } => self.frame_size(left),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.streams.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut seen = BTreeSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                return Err(PipelineError::EmptyName);
            }
            if !seen.insert(stream.name.as_str()) {
                return Err(PipelineError::DuplicateStream(stream.name.clone()));
            }
        }

        for stream in &self.streams {
            match &stream.node {
                Node::MonoCamera { socket, .. } if *socket == BoardSocket::Rgb => {
                    return Err(PipelineError::WrongSocket {
                        stream: stream.name.clone(),
                        node: "mono camera",
                        socket: *socket,
                    });
                }
                Node::ColorCamera { socket, .. } if *socket != BoardSocket::Rgb => {
                    return Err(PipelineError::WrongSocket {
                        stream: stream.name.clone(),
                        node: "color camera",
                        socket: *socket,
                    });
                }
                Node::StereoDepth { left, right, .. } => {
                    for input in [left, right] {
                        let is_mono = matches!(
                            self.stream(input).map(|s| &s.node),
                            Some(Node::MonoCamera { .. })
                        );
                        if !is_mono {
                            return Err(PipelineError::BadDepthInput {
                                stream: stream.name.clone(),
                                input: input.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_pipeline() -> Pipeline {
        Pipeline::new()
            .mono("left", BoardSocket::Left, MonoResolution::The400P)
            .mono("right", BoardSocket::Right, MonoResolution::The400P)
            .color(
                "rgb",
                ColorResolution::The720P,
                ColorOrder::Bgr,
                ColorOutput::Preview {
                    width: 640,
                    height: 480,
                },
            )
            .stereo_depth("depth", "left", "right", StereoDepthConfig::default())
    }

    #[test]
    fn stereo_pipeline_is_valid() {
        let pipeline = stereo_pipeline();
        assert_eq!(pipeline.validate(), Ok(()));

        let sockets: Vec<_> = pipeline.sockets().into_iter().collect();
        assert_eq!(
            sockets,
            vec![BoardSocket::Rgb, BoardSocket::Left, BoardSocket::Right]
        );
        assert_eq!(pipeline.frame_size("left"), Some((640, 400)));
        assert_eq!(pipeline.frame_size("rgb"), Some((640, 480)));
        assert_eq!(pipeline.frame_size("depth"), Some((640, 400)));
        assert_eq!(pipeline.frame_size("missing"), None);
    }

    #[test]
    fn duplicate_stream_names_are_rejected() {
        let pipeline = Pipeline::new()
            .mono("left", BoardSocket::Left, MonoResolution::The720P)
            .mono("left", BoardSocket::Right, MonoResolution::The720P);

        assert_eq!(
            pipeline.validate(),
            Err(PipelineError::DuplicateStream("left".to_string()))
        );
    }

    #[test]
    fn mono_camera_on_rgb_socket_is_rejected() {
        let pipeline = Pipeline::new().mono("left", BoardSocket::Rgb, MonoResolution::The720P);

        assert!(matches!(
            pipeline.validate(),
            Err(PipelineError::WrongSocket { .. })
        ));
    }

    #[test]
    fn depth_requires_mono_inputs() {
        let pipeline = Pipeline::new()
            .mono("left", BoardSocket::Left, MonoResolution::The400P)
            .color(
                "rgb",
                ColorResolution::The1080P,
                ColorOrder::Bgr,
                ColorOutput::Video,
            )
            .stereo_depth("depth", "left", "rgb", StereoDepthConfig::default());

        assert_eq!(
            pipeline.validate(),
            Err(PipelineError::BadDepthInput {
                stream: "depth".to_string(),
                input: "rgb".to_string(),
            })
        );
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert_eq!(Pipeline::new().validate(), Err(PipelineError::Empty));
    }

    #[test]
    fn pipeline_loads_from_json() {
        let json = r#"{
            "streams": [
                { "name": "left", "node": { "kind": "mono_camera", "socket": "left", "resolution": "720p" } },
                { "name": "rgb", "node": { "kind": "color_camera", "socket": "rgb", "resolution": "1080p" } }
            ]
        }"#;

        let pipeline: Pipeline = serde_json::from_str(json).unwrap();

        assert_eq!(pipeline.validate(), Ok(()));
        assert_eq!(pipeline.frame_size("left"), Some((1280, 720)));
        assert_eq!(
            pipeline.stream("rgb").unwrap().node,
            Node::ColorCamera {
                socket: BoardSocket::Rgb,
                resolution: ColorResolution::The1080P,
                color_order: ColorOrder::Bgr,
                output: ColorOutput::Video,
            }
        );
    }
}
