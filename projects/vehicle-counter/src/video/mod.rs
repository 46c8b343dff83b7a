pub mod opencv_reader;
pub mod preview;
pub mod processor;
pub mod writer;

use anyhow::Result;
use opencv::core::Mat;

pub trait VideoReader: Send {
    /// Frame count reported by the container; may be 0 when unknown.
    fn frame_count(&self) -> Result<usize>;
    fn source_fps(&self) -> Result<f64>;
    /// (width, height) of decoded frames.
    fn frame_size(&self) -> Result<(i32, i32)>;
    fn seek_to_frame(&mut self, frame_num: usize) -> Result<()>;
    /// Next frame in decode order. Fails at end of stream or on a decode error.
    fn read_frame(&mut self) -> Result<Mat>;
}

/// Destination for rendered frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}
