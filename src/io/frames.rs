//! Frame sources for acquisition sessions
//!
//! A frame source may stall (returns `None` for a cycle); the session treats
//! that as "no frame this cycle" rather than an error.

use async_trait::async_trait;
use image::DynamicImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("frame source {path} unavailable: {reason}")]
    Unavailable { path: String, reason: String },
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next camera frame, `None` when no frame is available right now
    async fn next_frame(&mut self) -> Option<DynamicImage>;
}

/// Replays image files from a directory in file-name order
pub struct ImageDirSource {
    files: Vec<PathBuf>,
    next: usize,
    repeat: bool,
}

impl ImageDirSource {
    pub fn open<P: AsRef<Path>>(dir: P, repeat: bool) -> Result<Self, FrameSourceError> {
        let dir = dir.as_ref();
        let unavailable = |reason: String| FrameSourceError::Unavailable {
            path: dir.display().to_string(),
            reason,
        };

        let entries = std::fs::read_dir(dir).map_err(|e| unavailable(e.to_string()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(unavailable("no image files".to_string()));
        }

        info!(dir = %dir.display(), frames = %files.len(), repeat = %repeat, "frame_source_opened");
        Ok(Self { files, next: 0, repeat })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FrameSource for ImageDirSource {
    async fn next_frame(&mut self) -> Option<DynamicImage> {
        if self.next >= self.files.len() {
            if !self.repeat {
                return None;
            }
            self.next = 0;
        }
        let path = self.files[self.next].clone();
        self.next += 1;

        let loaded = tokio::task::spawn_blocking({
            let path = path.clone();
            move || image::open(path)
        })
        .await;

        match loaded {
            Ok(Ok(frame)) => {
                debug!(file = %path.display(), "frame_loaded");
                Some(frame)
            }
            Ok(Err(e)) => {
                warn!(file = %path.display(), error = %e, "frame_decode_failed");
                None
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "frame_load_task_failed");
                None
            }
        }
    }
}

/// In-memory frames; `None` entries are stalls. Stalls forever once drained.
#[derive(Default)]
pub struct ScriptedFrames {
    frames: VecDeque<Option<DynamicImage>>,
}

impl ScriptedFrames {
    pub fn new<I>(frames: I) -> Self
    where
        I: IntoIterator<Item = Option<DynamicImage>>,
    {
        Self { frames: frames.into_iter().collect() }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl FrameSource for ScriptedFrames {
    async fn next_frame(&mut self) -> Option<DynamicImage> {
        self.frames.pop_front().flatten()
    }
}
