//! Feature-based motion clustering.
//!
//! Each frame's SIFT descriptors are matched against the previous frame's.
//! Matches that survive the ratio test mark image regions present in both
//! frames; dense groups of such locations get a bounding rectangle. Only one
//! frame of history is kept and clusters carry no identity between frames.

use log::trace;
use opencv::{
    core::{self, DMatch, KeyPoint, Mat, Point, Point2f, Ptr, Rect, Scalar, Vector},
    features2d::{FlannBasedMatcher, SIFT},
    flann::{IndexParams, KDTreeIndexParams, SearchParams},
    imgproc,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clustering::{cluster_points, BoundingBox, ClusterConfig},
    device::to_gray,
};

/// Lowe's distinctiveness ratio: keep a match only if its distance is below
/// this fraction of the runner-up's.
pub const RATIO_TEST_THRESHOLD: f32 = 0.7;

/// Color of the drawn cluster rectangles (BGR red).
const RECT_COLOR: (f64, f64, f64) = (0., 0., 255.);
const RECT_THICKNESS: i32 = 2;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
    #[error("invalid clustering parameters: {0}")]
    Clustering(#[from] linfa_clustering::DbscanParamsError),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub max_features: i32,
    pub octave_layers: i32,
    pub contrast_threshold: f64,
    pub edge_threshold: f64,
    pub sigma: f64,
}

impl Default for SiftConfig {
    fn default() -> Self {
        SiftConfig {
            max_features: 1000,
            octave_layers: 6,
            contrast_threshold: 0.03,
            edge_threshold: 8.0,
            sigma: 1.6,
        }
    }
}

/// Approximate nearest-neighbor search over randomized KD-trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlannConfig {
    pub trees: i32,
    pub checks: i32,
}

impl Default for FlannConfig {
    fn default() -> Self {
        FlannConfig {
            trees: 5,
            checks: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub sift: SiftConfig,
    pub flann: FlannConfig,
    pub clusters: ClusterConfig,
    pub ratio: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            sift: SiftConfig::default(),
            flann: FlannConfig::default(),
            clusters: ClusterConfig::default(),
            ratio: RATIO_TEST_THRESHOLD,
        }
    }
}

pub fn passes_ratio_test(best: f32, second: f32, ratio: f32) -> bool {
    best < ratio * second
}

/// Keep the best neighbor of every query whose two nearest neighbors pass
/// the ratio test. Queries with fewer than two neighbors are dropped.
pub fn select_distinct_matches<'a, I>(neighbors: I, ratio: f32) -> Vec<DMatch>
where
    I: IntoIterator<Item = &'a [DMatch]>,
{
    neighbors
        .into_iter()
        .filter_map(|candidates| match candidates {
            [best, second, ..] if passes_ratio_test(best.distance, second.distance, ratio) => {
                Some(*best)
            }
            _ => None,
        })
        .collect()
}

/// Holds at most one previous entry.
#[derive(Debug)]
pub struct FrameHistory<T> {
    previous: Option<T>,
}

impl<T> Default for FrameHistory<T> {
    fn default() -> Self {
        FrameHistory { previous: None }
    }
}

impl<T> FrameHistory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any entry has been stored. Never reverts.
    pub fn is_warm(&self) -> bool {
        self.previous.is_some()
    }

    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    /// Store `entry` as the previous one, returning the entry it replaces.
    pub fn replace(&mut self, entry: T) -> Option<T> {
        self.previous.replace(entry)
    }
}

/// Grayscale image and descriptors of one processed frame.
pub struct Keyframe {
    pub gray: Mat,
    pub descriptors: Mat,
}

pub struct MotionTracker {
    config: TrackerConfig,
    sift: Ptr<SIFT>,
    matcher: FlannBasedMatcher,
    history: FrameHistory<Keyframe>,
}

impl MotionTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, TrackingError> {
        let mut sift = SIFT::create_def()?;
        sift.set_n_features(config.sift.max_features)?;
        sift.set_n_octave_layers(config.sift.octave_layers)?;
        sift.set_contrast_threshold(config.sift.contrast_threshold)?;
        sift.set_edge_threshold(config.sift.edge_threshold)?;
        sift.set_sigma(config.sift.sigma)?;

        let index_params: Ptr<IndexParams> =
            Ptr::new(KDTreeIndexParams::new(config.flann.trees)?).into();
        let search_params = Ptr::new(SearchParams::new(config.flann.checks, 0., true, false)?);
        let matcher = FlannBasedMatcher::new(&index_params, &search_params)?;

        Ok(MotionTracker {
            config,
            sift,
            matcher,
            history: FrameHistory::new(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn history(&self) -> &FrameHistory<Keyframe> {
        &self.history
    }

    /// SIFT keypoints and descriptors of a grayscale image.
    pub fn detect(&mut self, gray: &Mat) -> Result<(Vector<KeyPoint>, Mat), TrackingError> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        self.sift
            .detect_and_compute(gray, &core::no_array(), &mut keypoints, &mut descriptors, false)?;
        Ok((keypoints, descriptors))
    }

    /// Locations in the current frame of keypoints that match the previous
    /// frame distinctively.
    fn matched_locations(
        &self,
        previous: &Mat,
        keypoints: &Vector<KeyPoint>,
        descriptors: &Mat,
    ) -> Result<Vec<Point2f>, TrackingError> {
        let mut neighbors = Vector::<Vector<DMatch>>::new();
        self.matcher.knn_match(
            previous,
            descriptors,
            &mut neighbors,
            2,
            &core::no_array(),
            false,
        )?;

        let neighbors: Vec<Vec<DMatch>> = neighbors.iter().map(|n| n.to_vec()).collect();
        let good = select_distinct_matches(neighbors.iter().map(Vec::as_slice), self.config.ratio);

        let mut locations = Vec::with_capacity(good.len());
        for m in good {
            locations.push(keypoints.get(m.train_idx as usize)?.pt());
        }
        Ok(locations)
    }

    /// Process one frame: find motion clusters against the previous frame,
    /// draw their bounding rectangles onto `frame`, and make this frame the
    /// new history. Returns the drawn rectangles.
    pub fn process(&mut self, frame: &mut Mat) -> Result<Vec<Rect>, TrackingError> {
        let gray = to_gray(frame)?;
        let (keypoints, descriptors) = self.detect(&gray)?;

        let mut rects = Vec::new();
        let previous = self
            .history
            .previous()
            .map(|keyframe| &keyframe.descriptors)
            .filter(|previous| !previous.empty());

        if let Some(previous) = previous {
            if !keypoints.is_empty() && !descriptors.empty() {
                let locations = self.matched_locations(previous, &keypoints, &descriptors)?;
                trace!(
                    "{} keypoints, {} distinctive matches",
                    keypoints.len(),
                    locations.len()
                );

                for cluster in cluster_points(&locations, &self.config.clusters)? {
                    if let Some(bounds) = BoundingBox::enclosing(&cluster) {
                        rects.push(bounds.to_rect());
                    }
                }
            }
        }

        for rect in &rects {
            draw_rect(frame, *rect)?;
        }

        self.history.replace(Keyframe { gray, descriptors });

        Ok(rects)
    }
}

fn draw_rect(frame: &mut Mat, rect: Rect) -> opencv::Result<()> {
    let (b, g, r) = RECT_COLOR;
    imgproc::rectangle_points(
        frame,
        Point::new(rect.x, rect.y),
        Point::new(rect.x + rect.width, rect.y + rect.height),
        Scalar::new(b, g, r, 0.),
        RECT_THICKNESS,
        imgproc::LINE_8,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use opencv::core::{CV_8UC1, CV_8UC3};

    fn dmatch(train_idx: i32, distance: f32) -> DMatch {
        DMatch {
            query_idx: 0,
            train_idx,
            img_idx: 0,
            distance,
        }
    }

    /// A BGR frame with high-contrast blobs that SIFT reliably picks up.
    fn textured_frame() -> Mat {
        let mut frame =
            Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.)).unwrap();
        for idx in 0..24 {
            let center = Point::new(40 + (idx % 6) * 100, 60 + (idx / 6) * 110);
            let radius = 8 + (idx % 4) * 5;
            imgproc::circle(
                &mut frame,
                center,
                radius,
                Scalar::all(255.),
                -1,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        frame
    }

    fn blank_frame() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.)).unwrap()
    }

    fn bytes(mat: &Mat) -> Vec<u8> {
        mat.data_bytes().unwrap().to_vec()
    }

    #[test]
    fn ratio_test_boundary_is_exclusive() {
        assert!(passes_ratio_test(0.69, 1.0, RATIO_TEST_THRESHOLD));
        assert!(!passes_ratio_test(0.71, 1.0, RATIO_TEST_THRESHOLD));
        assert!(!passes_ratio_test(70.0, 100.0, 0.7));
        assert!(passes_ratio_test(0.0, 0.5, RATIO_TEST_THRESHOLD));
        assert!(!passes_ratio_test(0.0, 0.0, RATIO_TEST_THRESHOLD));
    }

    #[test]
    fn distinct_matches_keep_best_neighbor() {
        let neighbors = vec![
            vec![dmatch(3, 10.0), dmatch(8, 100.0)],
            vec![dmatch(4, 69.0), dmatch(9, 100.0)],
            vec![dmatch(5, 70.0), dmatch(1, 100.0)],
            vec![dmatch(6, 10.0)],
            vec![],
        ];

        let good = select_distinct_matches(neighbors.iter().map(Vec::as_slice), 0.7);

        let train: Vec<_> = good.iter().map(|m| m.train_idx).collect();
        assert_eq!(train, vec![3, 4]);
    }

    #[test]
    fn history_goes_cold_to_warm_and_keeps_one_entry() {
        let mut history = FrameHistory::new();
        assert!(!history.is_warm());
        assert_eq!(history.previous(), None);

        assert_eq!(history.replace(1), None);
        assert!(history.is_warm());
        assert_eq!(history.replace(2), Some(1));
        assert_eq!(history.replace(3), Some(2));

        assert!(history.is_warm());
        assert_eq!(history.previous(), Some(&3));
    }

    #[test]
    fn default_config_matches_calibrated_values() {
        let config = TrackerConfig::default();

        assert_eq!(config.sift.max_features, 1000);
        assert_eq!(config.sift.contrast_threshold, 0.03);
        assert_eq!(config.sift.edge_threshold, 8.0);
        assert_eq!(config.sift.octave_layers, 6);
        assert_eq!(config.ratio, 0.7);
        assert_eq!(config.clusters.eps, 20.0);
        assert_eq!(config.clusters.min_points, 5);
    }

    #[test]
    fn history_holds_latest_frame_only() {
        let mut tracker = MotionTracker::new(TrackerConfig::default()).unwrap();
        let mut frames = vec![blank_frame(), textured_frame(), textured_frame()];
        // Variant of the last frame so it differs from the second one.
        imgproc::circle(
            &mut frames[2],
            Point::new(600, 450),
            12,
            Scalar::all(128.),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        for frame in frames.iter_mut() {
            let mut expected_gray = Mat::default();
            imgproc::cvt_color_def(&*frame, &mut expected_gray, imgproc::COLOR_BGR2GRAY).unwrap();
            let (_, expected_descriptors) = tracker.detect(&expected_gray).unwrap();

            tracker.process(&mut frame.clone()).unwrap();

            let keyframe = tracker.history().previous().unwrap();
            assert_eq!(bytes(&keyframe.gray), bytes(&expected_gray));
            assert_eq!(keyframe.descriptors.rows(), expected_descriptors.rows());
            if !expected_descriptors.empty() {
                assert_eq!(bytes(&keyframe.descriptors), bytes(&expected_descriptors));
            }
        }
    }

    #[test]
    fn first_frame_draws_nothing_and_warms_history() {
        let mut tracker = MotionTracker::new(TrackerConfig::default()).unwrap();
        let mut frame = textured_frame();
        let before = bytes(&frame);

        let rects = tracker.process(&mut frame).unwrap();

        assert!(rects.is_empty());
        assert_eq!(bytes(&frame), before);
        assert!(tracker.history().is_warm());
    }

    #[test]
    fn disjoint_frames_produce_no_rectangles() {
        let mut tracker = MotionTracker::new(TrackerConfig::default()).unwrap();

        // Nothing to match against: a featureless frame followed by a textured one.
        tracker.process(&mut blank_frame()).unwrap();
        let mut second = textured_frame();
        let before = bytes(&second);
        let rects = tracker.process(&mut second).unwrap();

        assert!(rects.is_empty());
        assert_eq!(bytes(&second), before);
        assert!(!tracker.history().previous().unwrap().descriptors.empty());
    }

    #[test]
    fn frame_without_keypoints_still_updates_history() {
        let mut tracker = MotionTracker::new(TrackerConfig::default()).unwrap();
        tracker.process(&mut textured_frame()).unwrap();

        let rects = tracker.process(&mut blank_frame()).unwrap();

        assert!(rects.is_empty());
        let keyframe = tracker.history().previous().unwrap();
        assert!(keyframe.descriptors.empty());
        assert_eq!(keyframe.gray.data_bytes().unwrap().iter().max(), Some(&0));
    }

    #[test]
    fn single_channel_frames_are_accepted() {
        let mut tracker = MotionTracker::new(TrackerConfig::default()).unwrap();
        let mut gray =
            Mat::new_rows_cols_with_default(120, 160, CV_8UC1, Scalar::all(30.)).unwrap();

        assert!(tracker.process(&mut gray).unwrap().is_empty());
        assert_eq!(tracker.history().previous().unwrap().gray.channels(), 1);
    }
}
