//! Fiducial marker detection and overlay.

use opencv::{
    core::{self, Mat, Point2f, Scalar, Vector},
    objdetect::{
        self, ArucoDetector, DetectorParameters, Dictionary, PredefinedDictionaryType,
        RefineParameters,
    },
    prelude::*,
};
use serde::{Deserialize, Serialize};

/// Predefined marker dictionaries the tools can look for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerDictionary {
    #[serde(rename = "4x4_50")]
    Dict4x4_50,
    #[serde(rename = "5x5_100")]
    Dict5x5_100,
    #[default]
    #[serde(rename = "6x6_250")]
    Dict6x6_250,
    #[serde(rename = "7x7_1000")]
    Dict7x7_1000,
    #[serde(rename = "aruco_original")]
    ArucoOriginal,
}

impl MarkerDictionary {
    fn predefined(self) -> PredefinedDictionaryType {
        match self {
            MarkerDictionary::Dict4x4_50 => PredefinedDictionaryType::DICT_4X4_50,
            MarkerDictionary::Dict5x5_100 => PredefinedDictionaryType::DICT_5X5_100,
            MarkerDictionary::Dict6x6_250 => PredefinedDictionaryType::DICT_6X6_250,
            MarkerDictionary::Dict7x7_1000 => PredefinedDictionaryType::DICT_7X7_1000,
            MarkerDictionary::ArucoOriginal => PredefinedDictionaryType::DICT_ARUCO_ORIGINAL,
        }
    }

    pub fn dictionary(self) -> opencv::Result<Dictionary> {
        objdetect::get_predefined_dictionary(self.predefined())
    }
}

/// Markers found in one frame.
#[derive(Debug, Default)]
pub struct Markers {
    /// Four image-plane corners per marker, clockwise from top-left.
    pub corners: Vector<Vector<Point2f>>,
    pub ids: Vector<i32>,
}

impl Markers {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<i32> {
        self.ids.to_vec()
    }

    /// Draw marker outlines and ids onto `image`. Does nothing when empty.
    pub fn draw(&self, image: &mut Mat) -> opencv::Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        objdetect::draw_detected_markers(
            image,
            &self.corners,
            &self.ids,
            Scalar::new(0., 255., 0., 0.),
        )
    }
}

pub struct MarkerDetector {
    detector: ArucoDetector,
    dictionary: MarkerDictionary,
}

impl MarkerDetector {
    pub fn new(dictionary: MarkerDictionary) -> opencv::Result<Self> {
        let detector = ArucoDetector::new(
            &dictionary.dictionary()?,
            &DetectorParameters::default()?,
            RefineParameters::new(10., 3., true)?,
        )?;

        Ok(MarkerDetector {
            detector,
            dictionary,
        })
    }

    pub fn dictionary(&self) -> MarkerDictionary {
        self.dictionary
    }

    /// Find every marker of the configured dictionary in `image`.
    pub fn detect(&self, image: &Mat) -> opencv::Result<Markers> {
        let mut markers = Markers::default();
        let mut rejected = Vector::<Vector<Point2f>>::new();

        self.detector
            .detect_markers(image, &mut markers.corners, &mut markers.ids, &mut rejected)?;

        Ok(markers)
    }
}

/// Render marker `id` as a `side_px` square black-and-white image.
pub fn render_marker(dictionary: MarkerDictionary, id: i32, side_px: i32) -> opencv::Result<Mat> {
    let mut marker = Mat::default();
    objdetect::generate_image_marker(&dictionary.dictionary()?, id, side_px, &mut marker, 1)?;
    Ok(marker)
}

/// `render_marker` surrounded by a white quiet zone of `margin_px` on each side.
pub fn render_marker_with_margin(
    dictionary: MarkerDictionary,
    id: i32,
    side_px: i32,
    margin_px: i32,
) -> opencv::Result<Mat> {
    let marker = render_marker(dictionary, id, side_px)?;
    let mut padded = Mat::default();
    core::copy_make_border(
        &marker,
        &mut padded,
        margin_px,
        margin_px,
        margin_px,
        margin_px,
        core::BORDER_CONSTANT,
        Scalar::all(255.),
    )?;
    Ok(padded)
}
