//! Frame persistence.
//!
//! Frames are written as PNG files named by their capture time in Unix
//! milliseconds. Two saves in the same millisecond target the same file and
//! the later one wins.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::debug;
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};
use thiserror::Error;

/// Directory of the single-camera saver.
pub const MONO_LEFT_DIR: &str = "disparity_images_left";
/// Base directory of the stereo pair saver.
pub const STEREO_BASE_DIR: &str = "images";
pub const STEREO_LEFT_SUBDIR: &str = "images_left";
pub const STEREO_RIGHT_SUBDIR: &str = "images_right";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("refusing to save an empty frame")]
    EmptyFrame,
    #[error("PNG encoder produced no data")]
    Encode,
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

pub fn file_name_for(timestamp_ms: i64) -> String {
    format!("{timestamp_ms}.png")
}

/// Writes frames into one directory.
pub struct ImageSaver {
    dir: PathBuf,
}

impl ImageSaver {
    /// Create the saver, creating `dir` and its parents if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            action: "creating directory",
            path: dir.clone(),
            source,
        })?;
        Ok(ImageSaver { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, timestamp_ms: i64) -> PathBuf {
        self.dir.join(file_name_for(timestamp_ms))
    }

    /// Save `image` as `<dir>/<timestamp_ms>.png`.
    ///
    /// The file only appears once it is complete: the PNG is encoded in
    /// memory, written next to its destination under a hidden name, then
    /// renamed.
    pub fn save(&self, image: &Mat, timestamp_ms: i64) -> Result<PathBuf, StorageError> {
        if image.empty() {
            return Err(StorageError::EmptyFrame);
        }

        let mut encoded = Vector::<u8>::new();
        if !imgcodecs::imencode(".png", image, &mut encoded, &Vector::new())? || encoded.is_empty()
        {
            return Err(StorageError::Encode);
        }

        let path = self.path_for(timestamp_ms);
        let partial = self.dir.join(format!(".{timestamp_ms}.png.part"));

        fs::write(&partial, encoded.to_vec()).map_err(|source| StorageError::Io {
            action: "writing",
            path: partial.clone(),
            source,
        })?;
        fs::rename(&partial, &path).map_err(|source| {
            let _ = fs::remove_file(&partial);
            StorageError::Io {
                action: "renaming",
                path: path.clone(),
                source,
            }
        })?;

        debug!("saved {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use opencv::{
        core::{Scalar, CV_8UC1, CV_8UC3},
        imgcodecs::IMREAD_UNCHANGED,
    };

    #[test]
    fn naming_is_timestamp_derived() {
        assert_eq!(file_name_for(1_700_000_000_123), "1700000000123.png");

        let root = tempfile::tempdir().unwrap();
        let saver = ImageSaver::new(root.path().join(MONO_LEFT_DIR)).unwrap();
        assert_eq!(
            saver.path_for(42),
            root.path().join("disparity_images_left").join("42.png")
        );
    }

    #[test]
    fn creates_nested_directories_on_first_use() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(STEREO_BASE_DIR).join(STEREO_LEFT_SUBDIR);

        ImageSaver::new(&dir).unwrap();
        assert!(dir.is_dir());

        // Already existing is fine.
        ImageSaver::new(&dir).unwrap();
    }

    #[test]
    fn saved_frame_round_trips_losslessly() {
        let root = tempfile::tempdir().unwrap();
        let saver = ImageSaver::new(root.path()).unwrap();
        let image = Mat::new_rows_cols_with_default(40, 60, CV_8UC3, Scalar::new(10., 20., 30., 0.))
            .unwrap();

        let path = saver.save(&image, 1234).unwrap();

        assert_eq!(path.file_name().unwrap(), "1234.png");
        let read_back = imgcodecs::imread(path.to_str().unwrap(), IMREAD_UNCHANGED).unwrap();
        assert_eq!(read_back.channels(), 3);
        assert_eq!(
            read_back.data_bytes().unwrap(),
            image.data_bytes().unwrap()
        );

        let leftovers: Vec<_> = fs::read_dir(root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("1234.png")]);
    }

    #[test]
    fn same_millisecond_saves_overwrite() {
        let root = tempfile::tempdir().unwrap();
        let saver = ImageSaver::new(root.path()).unwrap();
        let dark = Mat::new_rows_cols_with_default(8, 8, CV_8UC1, Scalar::all(0.)).unwrap();
        let bright = Mat::new_rows_cols_with_default(8, 8, CV_8UC1, Scalar::all(255.)).unwrap();

        saver.save(&dark, 7).unwrap();
        let path = saver.save(&bright, 7).unwrap();

        let read_back = imgcodecs::imread(path.to_str().unwrap(), IMREAD_UNCHANGED).unwrap();
        assert_eq!(*read_back.at_2d::<u8>(0, 0).unwrap(), 255);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn empty_frame_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let saver = ImageSaver::new(root.path()).unwrap();

        assert!(matches!(
            saver.save(&Mat::default(), 1),
            Err(StorageError::EmptyFrame)
        ));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
