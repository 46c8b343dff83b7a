use super::FrameSink;
use crate::error::PipelineError;
use anyhow::Result;
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use std::path::{Path, PathBuf};

/// mp4v-encoded output at the source resolution and frame rate.
pub struct OpencvWriter {
    writer: VideoWriter,
    path: PathBuf,
    frames_written: usize,
}

impl OpencvWriter {
    pub fn create(path: &Path, fps: f64, width: i32, height: i32) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| PipelineError::encode(path, "path is not valid UTF-8"))?;
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = VideoWriter::new(path_str, fourcc, fps, Size::new(width, height), true)
            .map_err(|e| PipelineError::encode(path, e))?;
        if !writer.is_opened()? {
            return Err(PipelineError::encode(path, "failed to open video writer").into());
        }

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            frames_written: 0,
        })
    }
}

impl OpencvWriter {
    pub fn frames_written(&self) -> usize {
        self.frames_written
    }
}

impl FrameSink for OpencvWriter {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        self.writer
            .write(frame)
            .map_err(|e| PipelineError::encode(&self.path, e))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.release()?;
        tracing::info!(
            "Wrote {} frames to {:?}",
            self.frames_written,
            self.path
        );
        Ok(())
    }
}
