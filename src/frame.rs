use chrono::{DateTime, Utc};
use opencv::{core::Mat, prelude::*};

/// One image delivered on an output stream.
///
/// Mono streams carry single-channel 8-bit images, color streams three
/// channels, depth streams single-channel 16-bit disparity.
pub struct Frame {
    pub stream: String,
    /// Arrival order on the device, shared by every stream produced in the
    /// same device tick.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    mat: Mat,
}

impl Frame {
    pub fn new(stream: &str, sequence: u64, captured_at: DateTime<Utc>, mat: Mat) -> Self {
        Frame {
            stream: stream.to_string(),
            sequence,
            captured_at,
            mat,
        }
    }

    /// The frame as a directly displayable 2D image.
    pub fn cv_frame(&self) -> &Mat {
        &self.mat
    }

    pub fn cv_frame_mut(&mut self) -> &mut Mat {
        &mut self.mat
    }

    pub fn into_mat(self) -> Mat {
        self.mat
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn channels(&self) -> i32 {
        self.mat.channels()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("stream", &self.stream)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("size", &(self.width(), self.height()))
            .field("channels", &self.channels())
            .finish()
    }
}
