//! Durable frame store
//!
//! Persists captured frames as files named `<prefix><YYYYMMDD_HHmmss>.<ext>`
//! and hands back a `FrameReference` that can cross a context boundary.
//! Frames are always PNG encoded; the extension is only a name.
//!
//! Names have second granularity. A second persist within the same second
//! replaces the first file.

use anyhow::Context;
use chrono::{Local, NaiveDateTime};
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capture::Frame;
use crate::error::{PipelineError, PipelineResult};

/// Stable, opaque name of a persisted frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameReference(String);

impl FrameReference {
    /// The reference as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl From<&str> for FrameReference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FrameReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for FrameReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frame store configuration
#[derive(Debug, Clone)]
pub struct FrameStoreConfig {
    /// Directory holding persisted frames
    pub dir: PathBuf,
    /// Fixed file name prefix
    pub prefix: String,
    /// File extension (without the dot)
    pub extension: String,
}

impl FrameStoreConfig {
    /// Configuration with the default `IMG_` prefix and `jpg` extension
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: "IMG_".to_string(),
            extension: "jpg".to_string(),
        }
    }
}

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Persists frames to disk and loads them back by reference
pub struct FrameStore {
    config: FrameStoreConfig,
    clock: Clock,
}

impl FrameStore {
    /// Create a frame store using the local wall clock for names
    pub fn new(config: FrameStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(|| Local::now().naive_local()))
    }

    /// Create a frame store with a custom clock
    pub fn with_clock(config: FrameStoreConfig, clock: Clock) -> Self {
        Self { config, clock }
    }

    /// Directory frames are written to
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// File name for a frame persisted at `at`
    fn file_name(&self, at: NaiveDateTime) -> String {
        format!(
            "{}{}.{}",
            self.config.prefix,
            at.format("%Y%m%d_%H%M%S"),
            self.config.extension
        )
    }

    /// Persist a frame, taking ownership of it.
    ///
    /// The in-memory buffer is dropped once the file is written.
    pub fn persist(&self, frame: Frame) -> PipelineResult<FrameReference> {
        std::fs::create_dir_all(&self.config.dir)
            .with_context(|| format!("Failed to create frame directory {:?}", self.config.dir))
            .map_err(PipelineError::PersistenceFailure)?;

        let dir = self
            .config
            .dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve frame directory {:?}", self.config.dir))
            .map_err(PipelineError::PersistenceFailure)?;

        let path = dir.join(self.file_name((self.clock)()));
        if path.exists() {
            warn!("Frame {:?} already exists and will be overwritten", path);
        }

        let image = frame.to_image().map_err(PipelineError::PersistenceFailure)?;
        drop(frame);

        // Write next to the target and rename so readers never see a partial file
        let temp_path = path.with_extension("tmp");
        image
            .save_with_format(&temp_path, ImageFormat::Png)
            .with_context(|| format!("Failed to write frame to {:?}", temp_path))
            .map_err(PipelineError::PersistenceFailure)?;

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            std::fs::remove_file(&temp_path).ok();
            return Err(PipelineError::PersistenceFailure(
                anyhow::Error::new(e).context(format!("Failed to move frame into {:?}", path)),
            ));
        }

        info!("Persisted frame to {:?}", path);
        Ok(FrameReference(path.to_string_lossy().into_owned()))
    }

    /// Load a persisted frame by reference
    pub fn load(&self, reference: &FrameReference) -> PipelineResult<Frame> {
        let path = reference.path();
        if !path.is_file() {
            return Err(PipelineError::NotFound(reference.clone()));
        }

        let reader = match ImageReader::open(path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound(reference.clone()));
            }
            Err(e) => {
                return Err(PipelineError::PersistenceFailure(
                    anyhow::Error::new(e).context(format!("Failed to open frame {:?}", path)),
                ));
            }
        };

        // The extension does not describe the encoding, so sniff the content
        let image = reader
            .with_guessed_format()
            .with_context(|| format!("Failed to read frame {:?}", path))
            .map_err(PipelineError::PersistenceFailure)?
            .decode()
            .with_context(|| format!("Failed to decode frame {:?}", path))
            .map_err(PipelineError::PersistenceFailure)?;

        debug!("Loaded frame {:?} ({}x{})", path, image.width(), image.height());
        Ok(Frame::from_image(image))
    }

    /// References of all persisted frames, newest first
    pub fn list(&self) -> PipelineResult<Vec<FrameReference>> {
        let entries = match std::fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PipelineError::PersistenceFailure(
                    anyhow::Error::new(e)
                        .context(format!("Failed to list {:?}", self.config.dir)),
                ));
            }
        };

        let suffix = format!(".{}", self.config.extension);
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(&self.config.prefix) && name.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();

        // Timestamped names sort chronologically
        paths.sort();
        paths.reverse();

        Ok(paths
            .into_iter()
            .map(|path| FrameReference(path.to_string_lossy().into_owned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn fixed_store(dir: &Path, time: NaiveDateTime) -> FrameStore {
        FrameStore::with_clock(FrameStoreConfig::in_dir(dir), Arc::new(move || time))
    }

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255]);
            }
        }
        Frame::new(data, width, height, PixelFormat::Rgba8).unwrap()
    }

    #[test]
    fn test_persist_then_load_preserves_pixels() {
        let dir = TempDir::new().unwrap();
        let store = FrameStore::new(FrameStoreConfig::in_dir(dir.path().join("OCR")));

        let frame = gradient_frame(100, 100);
        let expected = frame.data.clone();

        let reference = store.persist(frame).unwrap();
        let loaded = store.load(&reference).unwrap();

        assert_eq!(loaded.dimensions(), (100, 100));
        assert_eq!(loaded.format, PixelFormat::Rgba8);
        assert_eq!(loaded.data, expected);
    }

    #[test]
    fn test_rgb_frame_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FrameStore::new(FrameStoreConfig::in_dir(dir.path()));

        let data: Vec<u8> = (0..(7 * 5 * 3)).map(|v| v as u8).collect();
        let frame = Frame::new(data.clone(), 7, 5, PixelFormat::Rgb8).unwrap();

        let loaded = store.load(&store.persist(frame).unwrap()).unwrap();
        assert_eq!(loaded.format, PixelFormat::Rgb8);
        assert_eq!(loaded.data, data);
    }

    #[test]
    fn test_persist_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("Pictures").join("OCR");
        let store = FrameStore::new(FrameStoreConfig::in_dir(&nested));

        store.persist(gradient_frame(4, 4)).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_reference_uses_timestamped_name() {
        let dir = TempDir::new().unwrap();
        let store = fixed_store(dir.path(), at(14, 5, 9));

        let reference = store.persist(gradient_frame(2, 2)).unwrap();
        assert!(reference.as_str().ends_with("IMG_20240309_140509.jpg"));
    }

    #[test]
    fn test_png_bytes_behind_jpg_name() {
        let dir = TempDir::new().unwrap();
        let store = fixed_store(dir.path(), at(9, 0, 0));

        let reference = store.persist(gradient_frame(2, 2)).unwrap();
        let bytes = std::fs::read(reference.as_str()).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_same_second_overwrites_earlier_frame() {
        let dir = TempDir::new().unwrap();
        let store = fixed_store(dir.path(), at(12, 0, 0));

        let first = store.persist(Frame::new(vec![0; 4], 1, 1, PixelFormat::Rgba8).unwrap()).unwrap();
        let second = store.persist(Frame::new(vec![255; 4], 1, 1, PixelFormat::Rgba8).unwrap()).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.load(&first).unwrap().data, vec![255; 4]);
    }

    #[test]
    fn test_load_missing_reference_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FrameStore::new(FrameStoreConfig::in_dir(dir.path()));

        let reference = store.persist(gradient_frame(2, 2)).unwrap();
        std::fs::remove_file(reference.as_str()).unwrap();

        assert!(matches!(store.load(&reference), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_persist_into_unwritable_location_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();

        let store = FrameStore::new(FrameStoreConfig::in_dir(blocker.join("OCR")));
        let result = store.persist(gradient_frame(2, 2));
        assert!(matches!(result, Err(PipelineError::PersistenceFailure(_))));
    }

    #[test]
    fn test_list_newest_first() {
        let dir = TempDir::new().unwrap();
        fixed_store(dir.path(), at(8, 0, 0)).persist(gradient_frame(2, 2)).unwrap();
        fixed_store(dir.path(), at(9, 30, 0)).persist(gradient_frame(2, 2)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = FrameStore::new(FrameStoreConfig::in_dir(dir.path()));
        let listed = store.list().unwrap();

        assert_eq!(listed.len(), 2);
        assert!(listed[0].as_str().ends_with("IMG_20240309_093000.jpg"));
        assert!(listed[1].as_str().ends_with("IMG_20240309_080000.jpg"));
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let store = FrameStore::new(FrameStoreConfig::in_dir("/nonexistent/ocr-handoff/frames"));
        assert!(store.list().unwrap().is_empty());
    }
}
