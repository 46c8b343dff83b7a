use crate::error::PipelineError;
use crate::video::opencv_reader::OpencvReader;
use crate::video::VideoReader;
use anyhow::{anyhow, Result};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use std::path::Path;

/// Last decodable frame of `reader`. Seeks near the end first; when the
/// container lies about its length, falls back to whatever was read last.
pub fn last_frame(reader: &mut dyn VideoReader) -> Result<Mat> {
    let count = reader.frame_count()?;
    if count > 0 && reader.seek_to_frame(count - 1).is_ok() {
        if let Ok(frame) = reader.read_frame() {
            return Ok(frame);
        }
        reader.seek_to_frame(0)?;
    }

    let mut last = None;
    while let Ok(frame) = reader.read_frame() {
        last = Some(frame);
    }
    last.ok_or_else(|| anyhow!("Video contains no decodable frames"))
}

/// Writes the last frame of `video_path` to `image_path`.
pub fn extract_last_frame(video_path: &Path, image_path: &Path) -> Result<()> {
    let mut reader = OpencvReader::open(video_path)?;
    let frame = last_frame(&mut reader)?;

    let path_str = image_path
        .to_str()
        .ok_or_else(|| PipelineError::encode(image_path, "path is not valid UTF-8"))?;
    let written = imgcodecs::imwrite(path_str, &frame, &Vector::new())
        .map_err(|e| PipelineError::encode(image_path, e))?;
    if !written {
        return Err(PipelineError::encode(image_path, "imwrite refused the frame").into());
    }

    tracing::info!("Saved last frame of {:?} to {:?}", video_path, image_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::processor::testing::SyntheticReader;
    use opencv::prelude::*;

    #[test]
    fn test_last_frame_seeks_to_end() {
        let mut reader = SyntheticReader::new(16, 12, 5);
        let frame = last_frame(&mut reader).unwrap();
        assert_eq!(frame.rows(), 12);
        assert_eq!(reader.position, 5);
    }

    #[test]
    fn test_empty_video_has_no_last_frame() {
        let mut reader = SyntheticReader::new(16, 12, 0);
        assert!(last_frame(&mut reader).is_err());
    }
}
