//! Recorded-frame source: replays a directory of still images in name order.
//!
//! Stands in for the camera when the station runs against captured footage.

use hardhat_core::source::{CaptureError, Frame, FrameSource};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("replay directory not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Frame source over the image files of one directory.
pub struct ImageDirSource {
    files: Vec<PathBuf>,
    next: usize,
    sequence: u64,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self, ReplayError> {
        if !dir.is_dir() {
            return Err(ReplayError::NotFound(dir.to_path_buf()));
        }
        let entries = std::fs::read_dir(dir).map_err(|source| ReplayError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "opened replay source");
        Ok(Self {
            files,
            next: 0,
            sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageDirSource {
    /// An undecodable file costs one tick; the next call moves past it.
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let Some(path) = self.files.get(self.next) else {
            return Err(CaptureError::Exhausted);
        };
        self.next += 1;

        let image = image::open(path)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", path.display())))?
            .to_rgb8();
        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, shade: u8) {
        RgbImage::from_pixel(4, 3, Rgb([shade, shade, shade]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_replays_in_name_order_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "002.png", 20);
        write_png(dir.path(), "001.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.capture().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([10, 10, 10]));
        assert_eq!((first.width(), first.height()), (4, 3));

        let second = source.capture().unwrap();
        assert_eq!(second.image.get_pixel(0, 0), &Rgb([20, 20, 20]));

        assert!(matches!(source.capture(), Err(CaptureError::Exhausted)));
        assert!(matches!(source.capture(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001.jpg"), b"not a jpeg").unwrap();
        write_png(dir.path(), "002.png", 99);

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert!(matches!(source.capture(), Err(CaptureError::Unavailable(_))));
        let frame = source.capture().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.image.get_pixel(0, 0), &Rgb([99, 99, 99]));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(matches!(
            ImageDirSource::open(&missing),
            Err(ReplayError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_directory_exhausts_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert!(source.is_empty());
        assert!(matches!(source.capture(), Err(CaptureError::Exhausted)));
    }
}
