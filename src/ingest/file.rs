//! Local file frame source.
//!
//! Plays back a single image or every image in a directory (sorted by file
//! name), paced at `target_fps`. With `repeat` the sequence loops forever;
//! otherwise the last image is followed by end-of-input.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{frame_interval, FrameSource, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Image file, or directory of images.
    pub path: PathBuf,
    pub target_fps: u32,
    pub repeat: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            target_fps: 10,
            repeat: false,
        }
    }
}

pub struct FileSource {
    config: FileConfig,
    files: Vec<PathBuf>,
    next_index: usize,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        let files = list_images(&config.path)?;
        if files.is_empty() {
            return Err(anyhow!("no images found at {}", config.path.display()));
        }
        Ok(Self {
            config,
            files,
            next_index: 0,
            frame_count: 0,
            last_frame_at: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "FileSource: {} ({} image(s))",
            self.config.path.display(),
            self.files.len()
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.next_index >= self.files.len() {
            if !self.config.repeat {
                return Ok(None);
            }
            self.next_index = 0;
        }

        if let Some(last) = self.last_frame_at {
            let interval = frame_interval(self.config.target_fps);
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }

        let path = &self.files[self.next_index];
        self.next_index += 1;
        let image = image::open(path)
            .with_context(|| format!("decode {}", path.display()))?
            .into_rgb8();

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(Frame::from_image(image, self.frame_count)))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.path.display().to_string(),
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn list_images(path: &Path) -> Result<Vec<PathBuf>> {
    let metadata =
        std::fs::metadata(path).with_context(|| format!("open {}", path.display()))?;
    if metadata.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).with_context(|| format!("list {}", path.display()))? {
        let entry_path = entry?.path();
        if entry_path.is_file() && is_image(&entry_path) {
            files.push(entry_path);
        }
    }
    files.sort();
    Ok(files)
}
